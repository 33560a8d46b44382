//! Drive a complete flash sequence against a connected device
//!
//! [FlashSequencer] owns the build-flash-reset state machine: it builds
//! an artifact, revokes whoever currently holds the device (the console
//! reader, typically), takes exclusive ownership through the session,
//! walks the bootloader through erase and write, and hard-resets the
//! target before releasing the port again.

use std::time::Duration;

use log::debug;
use strum::Display;

use crate::{
    board::Board,
    compiler::{Artifact, Compiler},
    connection::reset::{hard_reset, reset_strategy_sequence},
    console::MessageLog,
    error::{Error, HandshakeError},
    protocol::{BootloaderProtocol, ProgressCallbacks},
    session::{Consumer, DeviceHandle, Session, REVOKE_TIMEOUT},
    sketch::Sketch,
};

/// The steps of a flash sequence.
///
/// A run walks `Idle` through `Resetting` in order and always lands
/// back on `Idle`; `Failed` is passed through on the error path.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum FlashStage {
    #[strum(serialize = "idle")]
    Idle,
    #[strum(serialize = "build")]
    Building,
    #[strum(serialize = "connect")]
    AwaitingPort,
    #[strum(serialize = "erase")]
    Erasing,
    #[strum(serialize = "write")]
    Writing,
    #[strum(serialize = "reset")]
    Resetting,
    #[strum(serialize = "failed")]
    Failed,
}

/// What actually gets written: an artifact pinned to a flash address.
///
/// Exists only for the duration of a single run and is never persisted.
#[derive(Debug, Clone)]
pub struct FlashJob {
    pub offset: u32,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

impl FlashJob {
    pub fn from_artifact(artifact: Artifact, compressed: bool) -> Self {
        FlashJob {
            offset: artifact.flash_offset,
            payload: artifact.data,
            compressed,
        }
    }
}

/// Sequences a full build-erase-write-reset cycle.
pub struct FlashSequencer {
    session: Session,
    log: MessageLog,
    compiler: Box<dyn Compiler + Send>,
    protocol: Box<dyn BootloaderProtocol>,
    stage: FlashStage,
    compress: bool,
    usb_serial_jtag: bool,
}

impl FlashSequencer {
    pub fn new(
        session: Session,
        log: MessageLog,
        compiler: Box<dyn Compiler + Send>,
        protocol: Box<dyn BootloaderProtocol>,
    ) -> Self {
        FlashSequencer {
            session,
            log,
            compiler,
            protocol,
            stage: FlashStage::Idle,
            compress: true,
            usb_serial_jtag: false,
        }
    }

    /// Disable deflate compression of the payload in transit.
    pub fn uncompressed(mut self) -> Self {
        self.compress = false;
        self
    }

    /// Use the reset sequence for ports backed by the built-in
    /// USB-Serial-JTAG peripheral.
    pub fn usb_serial_jtag(mut self, enabled: bool) -> Self {
        self.usb_serial_jtag = enabled;
        self
    }

    pub fn stage(&self) -> FlashStage {
        self.stage
    }

    /// Run the whole sequence for `sketch` targeting `board`.
    ///
    /// Not re-entrant: a request while a run is active is rejected with
    /// [Error::FlashInProgress]. Whatever happens, the device handle is
    /// released and the stage is back on [FlashStage::Idle] when this
    /// returns; failures additionally append a single `Error` message
    /// naming the failing step. Nothing is retried, a failed run must
    /// be re-issued by the user.
    pub fn run(
        &mut self,
        sketch: &Sketch,
        board: &Board,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        if self.stage != FlashStage::Idle {
            return Err(Error::FlashInProgress);
        }

        let result = self.sequence(sketch, board, progress);
        match &result {
            Ok(()) => self.log.info("Flashing complete"),
            Err(err) => {
                self.stage = FlashStage::Failed;
                match err {
                    Error::Flash { source, .. } => self.log.error(format!("{err}: {source}")),
                    other => self.log.error(other.to_string()),
                }
            }
        }
        self.stage = FlashStage::Idle;

        result
    }

    fn sequence(
        &mut self,
        sketch: &Sketch,
        board: &Board,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.set_stage(FlashStage::Building);
        self.log
            .info(format!("Building '{}' for {}", sketch.name, board.name));
        let artifact = self
            .compiler
            .build(sketch, board)
            .map_err(|e| stage_error(FlashStage::Building, e))?;
        let job = FlashJob::from_artifact(artifact, self.compress);

        // The console may still hold the device. Its revocation must
        // finish before the port is taken for flashing, so that two
        // writers never share the stream.
        self.set_stage(FlashStage::AwaitingPort);
        self.log.info("Preparing the serial port for flashing");
        let mut handle = self
            .session
            .revoke_and_acquire(Consumer::Flasher, REVOKE_TIMEOUT)
            .map_err(|e| stage_error(FlashStage::AwaitingPort, e))?;

        let result = self.drive(&mut handle, &job, progress);
        // Dropping the handle returns the transport to the session,
        // making it available for console acquisition again.
        drop(handle);

        result
    }

    fn drive(
        &mut self,
        handle: &mut DeviceHandle,
        job: &FlashJob,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.set_stage(FlashStage::Erasing);
        self.log.info(format!(
            "Erasing {:#x} bytes of flash at {:#x}",
            job.payload.len(),
            job.offset
        ));
        self.enter_bootloader(handle)
            .map_err(|e| stage_error(FlashStage::Erasing, e))?;
        self.protocol
            .erase_region(handle.transport(), job.offset, job.payload.len() as u32)
            .map_err(|e| stage_error(FlashStage::Erasing, e))?;

        if handle.is_revoked() {
            return Err(stage_error(FlashStage::Erasing, Error::Cancelled));
        }

        self.set_stage(FlashStage::Writing);
        self.log.info(format!(
            "Writing {:#x} bytes at {:#x}",
            job.payload.len(),
            job.offset
        ));
        self.protocol
            .write_region(
                handle.transport(),
                job.offset,
                &job.payload,
                job.compressed,
                progress,
            )
            .map_err(|e| stage_error(FlashStage::Writing, e))?;
        self.protocol
            .verify(handle.transport(), job.offset, &job.payload)
            .map_err(|e| stage_error(FlashStage::Writing, e))?;

        self.set_stage(FlashStage::Resetting);
        self.log.info("Resetting the device");
        hard_reset(handle.transport()).map_err(|e| stage_error(FlashStage::Resetting, e))?;

        Ok(())
    }

    /// Reset the target into download mode and sync with its bootloader,
    /// cycling through the applicable reset strategies.
    fn enter_bootloader(&mut self, handle: &mut DeviceHandle) -> Result<(), Error> {
        let mut last_error = None;

        for strategy in reset_strategy_sequence(self.usb_serial_jtag) {
            if handle.is_revoked() {
                return Err(Error::Cancelled);
            }

            strategy.reset(handle.transport())?;
            match self.protocol.sync(handle.transport()) {
                Ok(()) => {
                    let magic = self.protocol.chip_id(handle.transport())?;
                    debug!("synced with bootloader, chip magic {magic:#010x}");
                    return Ok(());
                }
                Err(err) => {
                    debug!("bootloader sync failed: {err}");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| HandshakeError::SyncFailed.into()))
    }

    fn set_stage(&mut self, stage: FlashStage) {
        debug!("flash stage: {} -> {}", self.stage, stage);
        self.stage = stage;
    }
}

fn stage_error(stage: FlashStage, source: Error) -> Error {
    Error::Flash {
        stage,
        source: Box::new(source),
    }
}
