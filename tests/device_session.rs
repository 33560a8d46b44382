//! End-to-end session scenarios: console hand-off, flashing, reconnects.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use sketchflash::{
    board::default_board,
    compiler::MockCompiler,
    console::{ConsoleReader, Direction, MessageLog},
    flasher::{FlashSequencer, FlashStage},
    protocol::NoProgress,
    session::{Consumer, Session, SessionStatus},
    sketch::Sketch,
    Error,
};

mod common;
use common::{wait_until, RecordingProtocol, ScriptedTransport};

fn sequencer(session: &Session, log: &MessageLog, protocol: RecordingProtocol) -> FlashSequencer {
    FlashSequencer::new(
        session.clone(),
        log.clone(),
        Box::new(MockCompiler::new().delay(Duration::ZERO).artifact_size(1024)),
        Box::new(protocol),
    )
}

#[test]
fn console_to_flash_hand_off_is_ordered_and_clean() {
    let session = Session::new();
    let log = MessageLog::new();

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = statuses.clone();
    session.subscribe(Box::new(move |status| seen.lock().unwrap().push(status)));

    // Connect and start the console, as the monitor command does.
    session
        .connect(Box::new(ScriptedTransport::new(&[b"hello\r\n"])))
        .unwrap();
    log.info("Connected at 115200 baud");

    let handle = session.acquire(Consumer::Console).unwrap();
    let console = ConsoleReader::spawn(handle, log.clone());

    assert!(wait_until(|| {
        log.snapshot()
            .iter()
            .any(|m| m.direction == Direction::Received && m.text.contains("hello"))
    }));
    assert_eq!(session.status(), SessionStatus::ConsoleActive);

    // Flashing revokes the console before taking the port.
    let (protocol, calls) = RecordingProtocol::new();
    let mut sequencer = sequencer(&session, &log, protocol);
    sequencer
        .run(&Sketch::blink(), &default_board(), &mut NoProgress)
        .unwrap();

    console.join().unwrap().unwrap();
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["sync", "chip_id", "erase", "write", "verify"]
    );
    assert_eq!(sequencer.stage(), FlashStage::Idle);
    assert_eq!(session.status(), SessionStatus::Connecting);

    // Status history walks connect -> console -> revoked -> flash ->
    // released.
    let seen = statuses.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            SessionStatus::Connecting,
            SessionStatus::ConsoleActive,
            SessionStatus::Connecting,
            SessionStatus::Flashing,
            SessionStatus::Connecting,
        ]
    );

    // Info messages for every step, in order.
    let infos: Vec<String> = log
        .snapshot()
        .iter()
        .filter(|m| m.direction == Direction::Info)
        .map(|m| m.text.clone())
        .collect();
    let expected_prefixes = [
        "Connected",
        "Building",
        "Preparing",
        "Erasing",
        "Writing",
        "Resetting",
        "Flashing complete",
    ];
    assert_eq!(infos.len(), expected_prefixes.len());
    for (info, prefix) in infos.iter().zip(expected_prefixes) {
        assert!(
            info.starts_with(prefix),
            "expected '{info}' to start with '{prefix}'"
        );
    }
}

#[test]
fn flash_with_no_device_fails_once_and_recovers() {
    let session = Session::new();
    let log = MessageLog::new();

    let (protocol, calls) = RecordingProtocol::new();
    let mut sequencer = sequencer(&session, &log, protocol);
    let err = sequencer
        .run(&Sketch::blink(), &default_board(), &mut NoProgress)
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Flash {
            stage: FlashStage::AwaitingPort,
            ..
        }
    ));
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(sequencer.stage(), FlashStage::Idle);
    assert_eq!(session.status(), SessionStatus::Disconnected);

    let errors = log
        .snapshot()
        .iter()
        .filter(|m| m.direction == Direction::Error)
        .count();
    assert_eq!(errors, 1);

    // A later connect still works; nothing is left half-held.
    session
        .connect(Box::new(ScriptedTransport::new(&[])))
        .unwrap();
    let handle = session.acquire(Consumer::Console).unwrap();
    assert_eq!(session.status(), SessionStatus::ConsoleActive);
    drop(handle);
}

#[test]
fn a_failed_write_releases_the_port_for_the_console() {
    let session = Session::new();
    let log = MessageLog::new();
    session
        .connect(Box::new(ScriptedTransport::new(&[])))
        .unwrap();

    let (protocol, calls) = RecordingProtocol::failing_at("write");
    let mut sequencer = sequencer(&session, &log, protocol);
    let err = sequencer
        .run(&Sketch::blink(), &default_board(), &mut NoProgress)
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Flash {
            stage: FlashStage::Writing,
            ..
        }
    ));
    assert_eq!(*calls.lock().unwrap(), vec!["sync", "chip_id", "erase", "write"]);
    assert_eq!(session.status(), SessionStatus::Connecting);

    // The console can take the port right back.
    let handle = session.acquire(Consumer::Console).unwrap();
    assert_eq!(session.status(), SessionStatus::ConsoleActive);
    drop(handle);
}

#[test]
fn reconnecting_preserves_the_log_until_cleared() {
    let session = Session::new();
    let log = MessageLog::new();

    session
        .connect(Box::new(ScriptedTransport::new(&[b"first session\r\n"])))
        .unwrap();
    log.info("Connected at 115200 baud");

    let handle = session.acquire(Consumer::Console).unwrap();
    let console = ConsoleReader::spawn(handle, log.clone());
    assert!(wait_until(|| {
        log.snapshot()
            .iter()
            .any(|m| m.text.contains("first session"))
    }));

    session.disconnect().unwrap();
    console.join().unwrap().unwrap();
    log.info("Disconnected");
    assert_eq!(session.status(), SessionStatus::Disconnected);

    // Reconnect: the log carries over, console comes back up.
    session
        .connect(Box::new(ScriptedTransport::new(&[b"second session\r\n"])))
        .unwrap();
    log.info("Connected at 115200 baud");
    let handle = session.acquire(Consumer::Console).unwrap();
    assert_eq!(session.status(), SessionStatus::ConsoleActive);
    let console = ConsoleReader::spawn(handle, log.clone());

    assert!(wait_until(|| {
        log.snapshot()
            .iter()
            .any(|m| m.text.contains("second session"))
    }));
    assert!(log
        .snapshot()
        .iter()
        .any(|m| m.text.contains("first session")));

    session.disconnect().unwrap();
    console.join().unwrap().unwrap();

    log.clear();
    assert!(log.is_empty());
}
