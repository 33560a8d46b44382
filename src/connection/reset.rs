//! DTR/RTS line sequencing for resetting a target device
//!
//! The timings mirror the behaviour of `esptool.py`: DTR conventionally
//! drives the boot-mode pin (IO0) and RTS the chip-enable pin (EN)
//! through the usual auto-reset circuit on development boards.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{connection::Transport, Error};

/// Time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms

/// Some strategy for dropping a target device into download mode.
pub trait ResetStrategy {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error>;
}

/// Classic reset sequence over a USB-to-serial bridge.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );

        transport.set_control_lines(false, true)?; // IO0 = HIGH, EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        transport.set_control_lines(true, false)?; // IO0 = LOW, EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        transport.set_control_lines(false, false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Reset sequence for devices connecting via the built-in
/// USB-JTAG-Serial peripheral rather than an external bridge.
#[derive(Debug, Clone, Copy)]
pub struct UsbJtagSerialReset;

impl ResetStrategy for UsbJtagSerialReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Using UsbJtagSerial reset strategy");

        transport.set_control_lines(false, false)?; // Idle

        sleep(Duration::from_millis(100));

        transport.set_control_lines(true, false)?; // Set IO0

        sleep(Duration::from_millis(100));

        transport.set_control_lines(false, true)?; // Reset

        sleep(Duration::from_millis(100));

        transport.set_control_lines(false, false)?;

        Ok(())
    }
}

/// Construct the sequence of reset strategies to attempt when entering
/// download mode, most likely first.
pub fn reset_strategy_sequence(usb_serial_jtag: bool) -> Vec<Box<dyn ResetStrategy>> {
    if usb_serial_jtag {
        vec![Box::new(UsbJtagSerialReset)]
    } else {
        vec![
            Box::new(ClassicReset::new(false)),
            Box::new(ClassicReset::new(true)),
        ]
    }
}

/// Reset the target device out of download mode and let it boot the
/// freshly written application.
pub fn hard_reset(transport: &mut dyn Transport) -> Result<(), Error> {
    debug!("Hard resetting the device");

    sleep(Duration::from_millis(100));

    transport.set_control_lines(false, true)?; // EN = LOW, chip in reset

    sleep(Duration::from_millis(100));

    transport.set_control_lines(false, false)?; // EN = HIGH, chip runs

    Ok(())
}
