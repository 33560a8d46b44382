//! Library and application errors

use std::io;

use miette::Diagnostic;
use slip_codec::SlipError;
use thiserror::Error;

use crate::{flasher::FlashStage, protocol::CommandType, session::Consumer};

/// All possible errors returned by sketchflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("The serial port '{0}' could not be opened")]
    #[diagnostic(
        code(sketchflash::port_unavailable),
        help("Make sure the device is plugged in and the port is not held by another application")
    )]
    PortUnavailable(String, #[source] serialport::Error),

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(sketchflash::no_serial),
        help("Make sure you have connected a device to the host system")
    )]
    NoSerial,

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(sketchflash::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("No device is connected to the session")]
    #[diagnostic(
        code(sketchflash::no_device),
        help("Select and open a serial port before starting a console or flashing")
    )]
    NoDevice,

    #[error("The device is already held by the {0} session")]
    #[diagnostic(
        code(sketchflash::already_held),
        help("Wait for the current holder to finish, or revoke it explicitly")
    )]
    AlreadyHeld(Consumer),

    #[error("The {0} session did not release the device in time")]
    #[diagnostic(code(sketchflash::revoke_timeout))]
    RevokeTimeout(Consumer),

    #[error("Operation was cancelled")]
    #[diagnostic(code(sketchflash::cancelled))]
    Cancelled,

    #[error("IO error while reading from the serial port")]
    #[diagnostic(code(sketchflash::read_error))]
    Read(#[source] io::Error),

    #[error("IO error while writing to the serial port")]
    #[diagnostic(code(sketchflash::write_error))]
    Write(#[source] io::Error),

    #[error("Failed to toggle the serial control lines")]
    #[diagnostic(code(sketchflash::control_lines))]
    ControlLines(#[source] serialport::Error),

    #[error("Failed to configure the serial port")]
    #[diagnostic(code(sketchflash::serial_config))]
    SerialConfig(#[source] serialport::Error),

    #[error("A flash request is already in progress")]
    #[diagnostic(
        code(sketchflash::flash_in_progress),
        help("Flash requests are not re-entrant; wait for the current one to finish")
    )]
    FlashInProgress,

    #[error("Flashing failed during the {stage} step")]
    #[diagnostic(code(sketchflash::flash_failed))]
    Flash {
        stage: FlashStage,
        #[source]
        source: Box<Error>,
    },

    #[error("Bootloader handshake failed")]
    #[diagnostic(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("Failed to build sketch '{sketch}': {reason}")]
    #[diagnostic(code(sketchflash::build_failed))]
    Build { sketch: String, reason: String },

    #[error("Project store operation failed")]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Errors produced while talking to a device's bootloader
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("Timeout while running the {0} command")]
    #[diagnostic(
        code(sketchflash::handshake::timeout),
        help("Try putting the device into download mode manually and flash again")
    )]
    Timeout(CommandType),

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(code(sketchflash::handshake::framing))]
    Framing,

    #[error("Received packet too large for buffer")]
    #[diagnostic(code(sketchflash::handshake::oversized_packet))]
    OversizedPacket,

    #[error("No valid response received for the {0} command")]
    #[diagnostic(code(sketchflash::handshake::no_response))]
    NoResponse(CommandType),

    #[error("Failed to sync with the bootloader")]
    #[diagnostic(
        code(sketchflash::handshake::sync),
        help("Ensure the reset and boot pins are not being held down")
    )]
    SyncFailed,

    #[error("The bootloader rejected the {command} command (status {code:#04x})")]
    #[diagnostic(code(sketchflash::handshake::rom))]
    Rom { command: CommandType, code: u8 },

    #[error("Flash verification failed: device reported {device:032x}, host computed {host:032x}")]
    #[diagnostic(code(sketchflash::handshake::digest_mismatch))]
    DigestMismatch { device: u128, host: u128 },

    #[error("IO error during the {0} command")]
    #[diagnostic(code(sketchflash::handshake::io))]
    Io(CommandType, #[source] io::Error),
}

impl HandshakeError {
    /// Map a SLIP decoding failure for the given command.
    pub(crate) fn from_slip(err: SlipError, command: CommandType) -> Self {
        match err {
            SlipError::FramingError => Self::Framing,
            SlipError::OversizedPacket => Self::OversizedPacket,
            SlipError::EndOfStream => Self::NoResponse(command),
            SlipError::ReadError(io) if io.kind() == io::ErrorKind::TimedOut => {
                Self::Timeout(command)
            }
            SlipError::ReadError(io) => Self::Io(command, io),
        }
    }
}

/// Errors produced by the record store backing project persistence
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("Failed to read or write the store file")]
    #[diagnostic(code(sketchflash::store::io))]
    Io(#[from] io::Error),

    #[error("Failed to serialize or deserialize a record")]
    #[diagnostic(code(sketchflash::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Record in table '{table}' is missing the '{field}' field")]
    #[diagnostic(code(sketchflash::store::missing_field))]
    MissingField {
        table: String,
        field: &'static str,
    },
}
