//! Shared test doubles for driving a session without hardware.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use sketchflash::{
    connection::Transport,
    protocol::{BootloaderProtocol, ProgressCallbacks},
    Error, HandshakeError,
};

/// Transport that replays canned read chunks, then times out forever.
pub struct ScriptedTransport {
    chunks: VecDeque<Vec<u8>>,
    timeout: Duration,
}

impl ScriptedTransport {
    pub fn new(chunks: &[&[u8]]) -> Self {
        ScriptedTransport {
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            timeout: Duration::from_millis(5),
        }
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.chunks.pop_front() {
            Some(chunk) => {
                let len = chunk.len().min(buf.len());
                buf[..len].copy_from_slice(&chunk[..len]);
                Ok(len)
            }
            None => {
                std::thread::sleep(self.timeout);
                Ok(0)
            }
        }
    }

    fn write_all(&mut self, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn set_control_lines(&mut self, _dtr: bool, _rts: bool) -> Result<(), Error> {
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, _baud: u32) -> Result<(), Error> {
        Ok(())
    }

    fn baud_rate(&self) -> Result<u32, Error> {
        Ok(115_200)
    }

    fn name(&self) -> Option<String> {
        Some("scripted".into())
    }
}

/// Bootloader double recording the order of protocol calls.
pub struct RecordingProtocol {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_at: Option<&'static str>,
}

impl RecordingProtocol {
    pub fn new() -> (Self, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            RecordingProtocol {
                calls: calls.clone(),
                fail_at: None,
            },
            calls,
        )
    }

    #[allow(dead_code)]
    pub fn failing_at(call: &'static str) -> (Self, Arc<Mutex<Vec<&'static str>>>) {
        let (mut protocol, calls) = Self::new();
        protocol.fail_at = Some(call);
        (protocol, calls)
    }

    fn record(&mut self, call: &'static str) -> Result<(), Error> {
        self.calls.lock().unwrap().push(call);
        if self.fail_at == Some(call) {
            Err(HandshakeError::SyncFailed.into())
        } else {
            Ok(())
        }
    }
}

impl BootloaderProtocol for RecordingProtocol {
    fn sync(&mut self, _transport: &mut dyn Transport) -> Result<(), Error> {
        self.record("sync")
    }

    fn chip_id(&mut self, _transport: &mut dyn Transport) -> Result<u32, Error> {
        self.record("chip_id")?;
        Ok(0x00F0_1D83)
    }

    fn erase_region(
        &mut self,
        _transport: &mut dyn Transport,
        _offset: u32,
        _size: u32,
    ) -> Result<(), Error> {
        self.record("erase")
    }

    fn write_region(
        &mut self,
        _transport: &mut dyn Transport,
        _offset: u32,
        _data: &[u8],
        _compressed: bool,
        _progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.record("write")
    }

    fn verify(
        &mut self,
        _transport: &mut dyn Transport,
        _offset: u32,
        _data: &[u8],
    ) -> Result<(), Error> {
        self.record("verify")
    }
}

/// Poll `condition` until it holds or a second has passed.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
