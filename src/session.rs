//! Session state for the single serial-connected device
//!
//! A [Session] owns at most one open [Transport] and arbitrates which of
//! the two competing consumers, the serial console or the firmware
//! flasher, currently holds it. Ownership is structural: acquiring the
//! device moves the transport into a [DeviceHandle], so a second holder
//! cannot exist while the first is alive. Dropping the handle returns
//! the transport to the session; revocation cancels the holder's
//! [CancelToken] and waits for the handle to come back.
//!
//! Status transitions are observable through [Session::subscribe] so a
//! UI can refresh itself on every change.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use log::debug;
use strum::Display;

use crate::{connection::Transport, Error};

/// How long [Session::revoke_and_acquire] waits for the current holder
/// to observe its cancellation and release the device.
pub const REVOKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The two consumers competing for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Consumer {
    /// The interactive serial console.
    Console,
    /// The firmware flasher.
    Flasher,
}

/// Logical status of the device connection.
///
/// Exactly one value holds at any time. `Connecting` covers every moment
/// in which the port is open (or being opened) but neither consumer
/// holds it: right after [Session::connect], and between hand-offs when
/// a handle has been released and nothing has reacquired the device yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    ConsoleActive,
    Flashing,
    Error,
}

/// Clone-able cooperative cancellation signal.
///
/// Holders of a [DeviceHandle] must check their token at every
/// suspension point and stop using the handle once it reads cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Irrevocable.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Callback invoked on every status transition.
pub type StatusObserver = Box<dyn Fn(SessionStatus) + Send + Sync>;

struct Inner {
    status: SessionStatus,
    /// Present while the port is open and no consumer holds it.
    transport: Option<Box<dyn Transport>>,
    holder: Option<(Consumer, CancelToken)>,
}

struct Shared {
    inner: Mutex<Inner>,
    released: Condvar,
    observers: Mutex<Vec<Arc<dyn Fn(SessionStatus) + Send + Sync>>>,
}

impl Shared {
    fn set_status(&self, inner: &mut Inner, status: SessionStatus) -> bool {
        if inner.status == status {
            return false;
        }

        debug!("Session status: {} -> {}", inner.status, status);
        inner.status = status;

        true
    }

    /// Callbacks run outside the internal locks, so an observer may
    /// query or subscribe to the session it is watching.
    fn notify(&self, status: SessionStatus) {
        let observers = self.observers.lock().unwrap().clone();
        for observer in observers.iter() {
            observer(status);
        }
    }
}

/// Arbiter for exclusive access to one serial-connected device.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    status: SessionStatus::Disconnected,
                    transport: None,
                    holder: None,
                }),
                released: Condvar::new(),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The current connection status.
    pub fn status(&self) -> SessionStatus {
        self.shared.inner.lock().unwrap().status
    }

    /// Register a callback invoked on every status transition.
    pub fn subscribe(&self, observer: StatusObserver) {
        self.shared.observers.lock().unwrap().push(Arc::from(observer));
    }

    /// Attach an open transport to the session.
    ///
    /// Fails with [Error::AlreadyHeld] while a consumer holds the
    /// device; otherwise replaces any previously attached transport.
    pub fn connect(&self, transport: Box<dyn Transport>) -> Result<(), Error> {
        let changed = {
            let mut inner = self.shared.inner.lock().unwrap();

            if let Some((holder, _)) = inner.holder {
                return Err(Error::AlreadyHeld(holder));
            }

            inner.transport = Some(transport);
            self.shared.set_status(&mut inner, SessionStatus::Connecting)
        };

        if changed {
            self.shared.notify(SessionStatus::Connecting);
        }

        Ok(())
    }

    /// Tear down the connection, revoking any current holder first.
    pub fn disconnect(&self) -> Result<(), Error> {
        let changed = {
            let mut inner = self.wait_for_release(REVOKE_TIMEOUT)?;
            inner.transport = None;
            self.shared
                .set_status(&mut inner, SessionStatus::Disconnected)
        };

        if changed {
            self.shared.notify(SessionStatus::Disconnected);
        }

        Ok(())
    }

    /// Take exclusive ownership of the device for `consumer`.
    ///
    /// Fails with [Error::AlreadyHeld] while another handle is alive and
    /// with [Error::NoDevice] when no transport is attached.
    pub fn acquire(&self, consumer: Consumer) -> Result<DeviceHandle, Error> {
        let handle = {
            let mut inner = self.shared.inner.lock().unwrap();
            self.acquire_locked(&mut inner, consumer)?
        };

        self.shared.notify(busy_status(consumer));

        Ok(handle)
    }

    /// Revoke the current holder, if any, then take exclusive ownership
    /// for `consumer`.
    ///
    /// Cancels the holder's token and waits up to `timeout` for the
    /// handle to be released; the revocation is guaranteed complete
    /// before this returns successfully.
    pub fn revoke_and_acquire(
        &self,
        consumer: Consumer,
        timeout: Duration,
    ) -> Result<DeviceHandle, Error> {
        let handle = {
            let mut inner = self.wait_for_release(timeout)?;
            self.acquire_locked(&mut inner, consumer)?
        };

        self.shared.notify(busy_status(consumer));

        Ok(handle)
    }

    fn acquire_locked(
        &self,
        inner: &mut Inner,
        consumer: Consumer,
    ) -> Result<DeviceHandle, Error> {
        if let Some((holder, _)) = inner.holder {
            return Err(Error::AlreadyHeld(holder));
        }

        let transport = inner.transport.take().ok_or(Error::NoDevice)?;
        let token = CancelToken::new();

        inner.holder = Some((consumer, token.clone()));
        self.shared.set_status(inner, busy_status(consumer));

        Ok(DeviceHandle {
            transport: Some(transport),
            token,
            consumer,
            shared: Arc::clone(&self.shared),
            discard: false,
        })
    }

    /// Cancel the current holder, if any, and wait for the handle to
    /// come back before handing out the lock.
    fn wait_for_release(
        &self,
        timeout: Duration,
    ) -> Result<std::sync::MutexGuard<'_, Inner>, Error> {
        let mut inner = self.shared.inner.lock().unwrap();

        let Some((holder, token)) = inner.holder.clone() else {
            return Ok(inner);
        };

        debug!("Revoking device handle held by {}", holder);
        token.cancel();

        let deadline = Instant::now() + timeout;
        while inner.holder.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::RevokeTimeout(holder));
            }

            let (guard, _) = self
                .shared
                .released
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }

        Ok(inner)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn busy_status(consumer: Consumer) -> SessionStatus {
    match consumer {
        Consumer::Console => SessionStatus::ConsoleActive,
        Consumer::Flasher => SessionStatus::Flashing,
    }
}

/// Exclusive ownership of the open device transport.
///
/// Exactly one handle exists at a time. Dropping the handle returns the
/// transport to the session for the next consumer; [DeviceHandle::discard]
/// destroys the connection instead, for fatal I/O errors.
pub struct DeviceHandle {
    transport: Option<Box<dyn Transport>>,
    token: CancelToken,
    consumer: Consumer,
    shared: Arc<Shared>,
    discard: bool,
}

impl DeviceHandle {
    /// Which consumer this handle was issued to.
    pub fn consumer(&self) -> Consumer {
        self.consumer
    }

    /// The cooperative cancellation token attached to this handle.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Whether the session has revoked this handle. A revoked handle
    /// must not be used for further reads or writes.
    pub fn is_revoked(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The underlying transport.
    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport
            .as_deref_mut()
            .expect("transport is only taken on drop")
    }

    /// Release the handle and tear down the connection. The session
    /// transitions through `Error` to `Disconnected`.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let transport = self.transport.take();

        let status = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.holder = None;

            let status = if self.discard {
                SessionStatus::Disconnected
            } else {
                inner.transport = transport;
                SessionStatus::Connecting
            };
            self.shared.set_status(&mut inner, status);

            status
        };

        self.shared.released.notify_all();

        if self.discard {
            // Make the failure visible to subscribers before settling on
            // the terminal status.
            self.shared.notify(SessionStatus::Error);
        }
        self.shared.notify(status);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::connection::Transport;

    struct NullTransport;

    impl Transport for NullTransport {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Error> {
            Ok(0)
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

        fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
            Ok(())
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        fn set_baud_rate(&mut self, _baud: u32) -> Result<(), Error> {
            Ok(())
        }

        fn baud_rate(&self) -> Result<u32, Error> {
            Ok(115_200)
        }

        fn name(&self) -> Option<String> {
            None
        }
    }

    fn connected_session() -> Session {
        let session = Session::new();
        session.connect(Box::new(NullTransport)).unwrap();
        session
    }

    #[test]
    fn at_most_one_holder_exists() {
        let session = connected_session();

        let handle = session.acquire(Consumer::Console).unwrap();
        assert!(matches!(
            session.acquire(Consumer::Flasher),
            Err(Error::AlreadyHeld(Consumer::Console))
        ));

        drop(handle);
        let handle = session.acquire(Consumer::Flasher).unwrap();
        assert!(matches!(
            session.acquire(Consumer::Console),
            Err(Error::AlreadyHeld(Consumer::Flasher))
        ));
        drop(handle);
    }

    #[test]
    fn acquire_without_transport_fails() {
        let session = Session::new();
        assert!(matches!(
            session.acquire(Consumer::Console),
            Err(Error::NoDevice)
        ));
    }

    #[test]
    fn status_follows_the_holder() {
        let session = connected_session();
        assert_eq!(session.status(), SessionStatus::Connecting);

        let handle = session.acquire(Consumer::Console).unwrap();
        assert_eq!(session.status(), SessionStatus::ConsoleActive);

        drop(handle);
        assert_eq!(session.status(), SessionStatus::Connecting);

        let handle = session.acquire(Consumer::Flasher).unwrap();
        assert_eq!(session.status(), SessionStatus::Flashing);
        drop(handle);

        session.disconnect().unwrap();
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[test]
    fn revoke_cancels_the_holder_before_reacquiring() {
        let session = connected_session();

        let handle = session.acquire(Consumer::Console).unwrap();
        let token = handle.token();

        // A cooperative holder: parks on its token and releases once
        // cancelled, like the console read loop does.
        let holder = thread::spawn(move || {
            while !handle.is_revoked() {
                thread::sleep(Duration::from_millis(1));
            }
            drop(handle);
        });

        let flash_handle = session
            .revoke_and_acquire(Consumer::Flasher, Duration::from_secs(1))
            .unwrap();
        // By the time acquisition returns the old holder must be gone.
        assert!(token.is_cancelled());
        assert_eq!(flash_handle.consumer(), Consumer::Flasher);

        holder.join().unwrap();
        drop(flash_handle);
    }

    #[test]
    fn revoke_times_out_on_an_uncooperative_holder() {
        let session = connected_session();
        let handle = session.acquire(Consumer::Console).unwrap();

        assert!(matches!(
            session.revoke_and_acquire(Consumer::Flasher, Duration::from_millis(50)),
            Err(Error::RevokeTimeout(Consumer::Console))
        ));

        drop(handle);
    }

    #[test]
    fn discard_tears_the_session_down() {
        let session = connected_session();
        let statuses: Arc<Mutex<Vec<SessionStatus>>> = Arc::default();

        let seen = Arc::clone(&statuses);
        session.subscribe(Box::new(move |status| {
            seen.lock().unwrap().push(status);
        }));

        let handle = session.acquire(Consumer::Console).unwrap();
        handle.discard();

        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                SessionStatus::ConsoleActive,
                SessionStatus::Error,
                SessionStatus::Disconnected
            ]
        );
        // The transport is gone with the handle.
        assert!(matches!(
            session.acquire(Consumer::Console),
            Err(Error::NoDevice)
        ));
    }

    #[test]
    fn observers_see_every_transition() {
        let session = Session::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&count);
        session.subscribe(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        session.connect(Box::new(NullTransport)).unwrap();
        let handle = session.acquire(Consumer::Console).unwrap();
        drop(handle);
        session.disconnect().unwrap();

        // Connecting, ConsoleActive, Connecting, Disconnected.
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn observers_may_use_the_session_reentrantly() {
        let session = Session::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let watched = session.clone();
        let sink = Arc::clone(&seen);
        session.subscribe(Box::new(move |status| {
            // Querying and subscribing from a callback must not deadlock.
            watched.subscribe(Box::new(|_| {}));
            sink.lock().unwrap().push((status, watched.status()));
        }));

        session.connect(Box::new(NullTransport)).unwrap();
        session.disconnect().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (SessionStatus::Connecting, SessionStatus::Connecting),
                (SessionStatus::Disconnected, SessionStatus::Disconnected),
            ]
        );
    }
}
