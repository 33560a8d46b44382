//! Supported development boards
//!
//! Each board is identified by its FQBN (fully-qualified board name),
//! the `vendor:architecture:board` triple used by the Arduino toolchain
//! to select a compilation target.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, VariantNames};

/// Platform families the board catalog is grouped by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames, Serialize,
    Deserialize,
)]
#[non_exhaustive]
pub enum Platform {
    #[strum(serialize = "ESP32")]
    #[serde(rename = "ESP32")]
    Esp32,
    #[strum(serialize = "ESP8266")]
    #[serde(rename = "ESP8266")]
    Esp8266,
    #[strum(serialize = "Arduino AVR")]
    #[serde(rename = "Arduino AVR")]
    ArduinoAvr,
    #[strum(serialize = "Arduino SAMD")]
    #[serde(rename = "Arduino SAMD")]
    ArduinoSamd,
    #[strum(serialize = "RP2040")]
    #[serde(rename = "RP2040")]
    Rp2040,
    #[strum(serialize = "STM32")]
    #[serde(rename = "STM32")]
    Stm32,
}

/// A flashable development board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// Catalog identifier, e.g. `esp32-dev`.
    pub id: String,
    /// Human-readable name, e.g. `ESP32 Dev Module`.
    pub name: String,
    /// Fully-qualified board name, e.g. `esp32:esp32:esp32`.
    pub fqbn: String,
    /// Platform family this board belongs to.
    pub platform: Platform,
}

impl Board {
    fn new(id: &str, name: &str, fqbn: &str, platform: Platform) -> Self {
        Board {
            id: id.into(),
            name: name.into(),
            fqbn: fqbn.into(),
            platform,
        }
    }

    /// Whether this board speaks the Espressif serial bootloader
    /// protocol (as opposed to avrdude, bossac, etc.).
    pub fn is_espressif(&self) -> bool {
        matches!(self.platform, Platform::Esp32 | Platform::Esp8266)
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.fqbn)
    }
}

/// The built-in board catalog.
pub fn boards() -> Vec<Board> {
    use Platform::*;

    vec![
        // ESP32 family
        Board::new("esp32-dev", "ESP32 Dev Module", "esp32:esp32:esp32", Esp32),
        Board::new("esp32-s2", "ESP32-S2 Dev Module", "esp32:esp32:esp32s2", Esp32),
        Board::new("esp32-s3", "ESP32-S3 Dev Module", "esp32:esp32:esp32s3", Esp32),
        Board::new("esp32-c3", "ESP32-C3 Dev Module", "esp32:esp32:esp32c3", Esp32),
        Board::new("esp32-c6", "ESP32-C6 Dev Module", "esp32:esp32:esp32c6", Esp32),
        Board::new(
            "esp32-wrover",
            "ESP32 Wrover Module",
            "esp32:esp32:esp32wrover",
            Esp32,
        ),
        Board::new("esp32-cam", "ESP32-CAM", "esp32:esp32:esp32cam", Esp32),
        // ESP8266 family
        Board::new(
            "esp8266-nodemcu",
            "NodeMCU 1.0 (ESP-12E)",
            "esp8266:esp8266:nodemcuv2",
            Esp8266,
        ),
        Board::new(
            "esp8266-wemos-d1",
            "Wemos D1 Mini",
            "esp8266:esp8266:d1_mini",
            Esp8266,
        ),
        Board::new(
            "esp8266-generic",
            "Generic ESP8266 Module",
            "esp8266:esp8266:generic",
            Esp8266,
        ),
        // Arduino AVR
        Board::new("arduino-uno", "Arduino Uno", "arduino:avr:uno", ArduinoAvr),
        Board::new(
            "arduino-mega",
            "Arduino Mega 2560",
            "arduino:avr:mega",
            ArduinoAvr,
        ),
        Board::new("arduino-nano", "Arduino Nano", "arduino:avr:nano", ArduinoAvr),
        Board::new(
            "arduino-leonardo",
            "Arduino Leonardo",
            "arduino:avr:leonardo",
            ArduinoAvr,
        ),
        Board::new(
            "arduino-micro",
            "Arduino Micro",
            "arduino:avr:micro",
            ArduinoAvr,
        ),
        Board::new(
            "arduino-pro-mini",
            "Arduino Pro Mini",
            "arduino:avr:pro",
            ArduinoAvr,
        ),
        // Arduino SAMD
        Board::new(
            "arduino-mkr1000",
            "Arduino MKR1000",
            "arduino:samd:mkr1000",
            ArduinoSamd,
        ),
        Board::new(
            "arduino-mkrwifi1010",
            "Arduino MKR WiFi 1010",
            "arduino:samd:mkrwifi1010",
            ArduinoSamd,
        ),
        Board::new(
            "arduino-nano33iot",
            "Arduino Nano 33 IoT",
            "arduino:samd:nano_33_iot",
            ArduinoSamd,
        ),
        // RP2040
        Board::new("rpi-pico", "Raspberry Pi Pico", "rp2040:rp2040:rpipico", Rp2040),
        Board::new(
            "rpi-pico-w",
            "Raspberry Pi Pico W",
            "rp2040:rp2040:rpipicow",
            Rp2040,
        ),
        // STM32
        Board::new(
            "stm32-bluepill",
            "STM32 Blue Pill",
            "STMicroelectronics:stm32:GenF1",
            Stm32,
        ),
        Board::new(
            "stm32-nucleo-f401re",
            "STM32 Nucleo-64 F401RE",
            "STMicroelectronics:stm32:Nucleo_64",
            Stm32,
        ),
    ]
}

/// Look a board up by its catalog id.
pub fn find_by_id(id: &str) -> Option<Board> {
    boards().into_iter().find(|b| b.id == id)
}

/// Look a board up by its FQBN.
pub fn find_by_fqbn(fqbn: &str) -> Option<Board> {
    boards().into_iter().find(|b| b.fqbn == fqbn)
}

/// The default board preselected for new sketches.
pub fn default_board() -> Board {
    Board::new("esp32-dev", "ESP32 Dev Module", "esp32:esp32:esp32", Platform::Esp32)
}

/// All platform families present in the catalog, in declaration order.
pub fn platforms() -> Vec<Platform> {
    Platform::iter().collect()
}
