//! Command-line interface configuration
//!
//! The [Config] type handles loading and saving of the configuration
//! file: a preferred serial port, known USB devices, the default baud
//! rate and the location of the project store.

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::PathBuf,
};

use directories::ProjectDirs;
use log::debug;
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};
use serialport::UsbPortInfo;

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
}

/// A configured, known USB device
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
}

fn serialize_u16_to_hex<S>(decimal: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{decimal:04x}"))
}

impl UsbDevice {
    /// Check if the given USB port matches this device
    pub fn matches(&self, port: &UsbPortInfo) -> bool {
        self.vid == port.vid && self.pid == port.pid
    }
}

/// Deserialized contents of the configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Preferred serial port connection information
    #[serde(default)]
    pub connection: Connection,
    /// Preferred USB devices
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    /// Default baud rate for the serial console
    #[serde(default)]
    pub baudrate: Option<u32>,
    /// Location of the JSON project store
    #[serde(default)]
    pub projects_file: Option<PathBuf>,
    /// Path of the file to save the configuration to
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("", "", "sketchflash")
            .ok_or_else(|| miette!("No valid home directory path could be retrieved"))
    }

    /// Load configuration from the configuration file
    pub fn load() -> Result<Self> {
        let file = Self::project_dirs()?.config_dir().join("sketchflash.toml");

        let mut config = if let Ok(data) = read_to_string(&file) {
            toml::from_str(&data)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to parse {}", file.display()))?
        } else {
            Self::default()
        };
        config.save_path = file;
        debug!("Config: {:#?}", config);

        Ok(config)
    }

    /// Save the configuration file, applying `modify` first
    pub fn save_with<F: Fn(&mut Self)>(&self, modify: F) -> Result<()> {
        let mut copy = self.clone();
        modify(&mut copy);

        let serialized = toml::to_string(&copy)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;

        if let Some(parent) = self.save_path.parent() {
            create_dir_all(parent)
                .into_diagnostic()
                .wrap_err("Failed to create config directory")?;
        }
        write(&self.save_path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", self.save_path.display()))
    }

    /// Path of the JSON file backing the project store
    pub fn projects_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.projects_file {
            return Ok(path.clone());
        }

        Ok(Self::project_dirs()?.data_dir().join("projects.json"))
    }
}
