//! Serial console: the message log and the read loop
//!
//! Incoming bytes are appended to a [MessageLog] as `Received`
//! [SerialMessage]s. The log is append-only and time-ordered; it is
//! never cleared implicitly, only by an explicit [MessageLog::clear]
//! (reconnecting continues the existing log).
//!
//! Unlike monitors that buffer until a newline, output is appended as
//! soon as it is read, so partial lines from `print!()`-style firmware
//! output show up immediately.

use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::SystemTime,
};

use log::debug;
use strum::Display;

use crate::{session::DeviceHandle, Error};

/// Rewrite lone `\n` and bare `\r` line endings as CRLF pairs, as
/// required by a terminal in raw mode. Existing CRLF pairs pass
/// through untouched.
pub(crate) fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            b'\r' if input.get(i + 1) == Some(&b'\n') => {
                out.extend_from_slice(b"\r\n");
                i += 2;
            }
            b'\r' | b'\n' => {
                out.extend_from_slice(b"\r\n");
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    out
}

/// Classification of a [SerialMessage].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// Written to the device by the user.
    Sent,
    /// Read from the device.
    Received,
    /// Produced by the session controller itself.
    Info,
    /// A failure surfaced to the user.
    Error,
}

/// One immutable entry in the serial console log.
#[derive(Debug, Clone)]
pub struct SerialMessage {
    pub timestamp: SystemTime,
    pub text: String,
    pub direction: Direction,
}

impl SerialMessage {
    pub fn new(direction: Direction, text: impl Into<String>) -> Self {
        SerialMessage {
            timestamp: SystemTime::now(),
            text: text.into(),
            direction,
        }
    }
}

/// Callback invoked for every appended message.
pub type MessageObserver = Box<dyn Fn(&SerialMessage) + Send + Sync>;

struct LogInner {
    messages: Mutex<Vec<SerialMessage>>,
    observers: Mutex<Vec<Arc<dyn Fn(&SerialMessage) + Send + Sync>>>,
}

/// Append-only, time-ordered log of serial traffic.
///
/// Cheap to clone; clones share the same entries, so the console reader
/// and the flash sequencer can feed one log rendered by the UI.
#[derive(Clone)]
pub struct MessageLog {
    inner: Arc<LogInner>,
}

impl MessageLog {
    pub fn new() -> Self {
        MessageLog {
            inner: Arc::new(LogInner {
                messages: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Append a message and notify observers.
    ///
    /// Callbacks run outside the internal locks, so an observer may
    /// append to or subscribe to the log it is watching.
    pub fn push(&self, message: SerialMessage) {
        self.inner.messages.lock().unwrap().push(message.clone());

        let observers = self.inner.observers.lock().unwrap().clone();
        for observer in observers.iter() {
            observer(&message);
        }
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(SerialMessage::new(Direction::Info, text));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(SerialMessage::new(Direction::Error, text));
    }

    pub fn sent(&self, text: impl Into<String>) {
        self.push(SerialMessage::new(Direction::Sent, text));
    }

    pub fn received(&self, text: impl Into<String>) {
        self.push(SerialMessage::new(Direction::Received, text));
    }

    /// Register a callback invoked for every appended message.
    pub fn subscribe(&self, observer: MessageObserver) {
        self.inner.observers.lock().unwrap().push(Arc::from(observer));
    }

    /// Drop all entries. Only ever called on explicit user request.
    pub fn clear(&self) {
        self.inner.messages.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the current entries.
    pub fn snapshot(&self) -> Vec<SerialMessage> {
        self.inner.messages.lock().unwrap().clone()
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains a held device handle into a [MessageLog].
///
/// The loop runs until the stream ends, the handle is revoked, or an
/// I/O error occurs. Cancellation is cooperative and bounded: the token
/// is checked every read cycle and reads time out after the transport's
/// configured timeout, so the loop is never left running once the
/// session has completed a revocation.
pub struct ConsoleReader {
    log: MessageLog,
}

impl ConsoleReader {
    pub fn new(log: MessageLog) -> Self {
        ConsoleReader { log }
    }

    /// Run the read loop to completion.
    ///
    /// Returns `Ok(())` on cancellation or clean stream end. On an I/O
    /// error the failure is appended to the log as an `Error` message
    /// and returned; the caller must discard the handle.
    pub fn run(&self, handle: &mut DeviceHandle) -> Result<(), Error> {
        let token = handle.token();
        let mut buf = [0; 1024];

        loop {
            if token.is_cancelled() {
                debug!("Console reader cancelled");
                return Ok(());
            }

            let count = match handle.transport().read(&mut buf) {
                Ok(0) => continue,
                Ok(count) => count,
                Err(Error::Read(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("Serial stream ended");
                    return Ok(());
                }
                Err(e) => {
                    self.log.error(format!("Serial read failed: {e}"));
                    return Err(e);
                }
            };

            let text = String::from_utf8_lossy(&buf[..count]).into_owned();
            self.log.received(text);
        }
    }

    /// Run the read loop on its own thread, consuming the handle.
    ///
    /// The handle is released when the loop stops; a fatal I/O error
    /// discards it, tearing the session down.
    pub fn spawn(mut handle: DeviceHandle, log: MessageLog) -> JoinHandle<Result<(), Error>> {
        std::thread::spawn(move || {
            let reader = ConsoleReader::new(log);
            match reader.run(&mut handle) {
                Ok(()) => Ok(()),
                Err(e) => {
                    handle.discard();
                    Err(e)
                }
            }
        })
    }
}
