//! Interactive serial monitor
//!
//! Runs the console over an exclusively held device handle: received
//! bytes go to the terminal (and the message log), keystrokes go to the
//! device. The loop also watches for revocation, so a concurrent flash
//! request takes the port away cleanly.

use std::{
    io::{stdout, Write},
    thread::sleep,
    time::Duration,
};

use crossterm::{
    event::{poll, read, Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use miette::{IntoDiagnostic, Result};

use crate::{
    connection::reset::hard_reset,
    console::{normalize_line_endings, MessageLog},
    session::DeviceHandle,
};

/// Converts key events from crossterm into appropriate character/escape
/// sequences which are then sent over the serial connection.
///
/// Adapted from https://github.com/dhylands/serial-monitor
fn handle_key_event(key_event: KeyEvent) -> Option<Vec<u8>> {
    // The following escape sequences come from the MicroPython codebase.
    //
    //  Up      ESC [A
    //  Down    ESC [B
    //  Right   ESC [C
    //  Left    ESC [D
    //  Home    ESC [H  or ESC [1~
    //  End     ESC [F  or ESC [4~
    //  Del     ESC [3~
    //  Insert  ESC [2~

    let mut buf = [0; 4];

    let key_str: Option<&[u8]> = match key_event.code {
        KeyCode::Backspace => Some(b"\x08"),
        KeyCode::Enter => Some(b"\r"),
        KeyCode::Left => Some(b"\x1b[D"),
        KeyCode::Right => Some(b"\x1b[C"),
        KeyCode::Home => Some(b"\x1b[H"),
        KeyCode::End => Some(b"\x1b[F"),
        KeyCode::Up => Some(b"\x1b[A"),
        KeyCode::Down => Some(b"\x1b[B"),
        KeyCode::Tab => Some(b"\x09"),
        KeyCode::Delete => Some(b"\x1b[3~"),
        KeyCode::Insert => Some(b"\x1b[2~"),
        KeyCode::Esc => Some(b"\x1b"),
        KeyCode::Char(ch) => {
            if key_event.modifiers & KeyModifiers::CONTROL == KeyModifiers::CONTROL {
                buf[0] = ch as u8;
                if ch.is_ascii_lowercase() || (ch == ' ') {
                    buf[0] &= 0x1f;
                    Some(&buf[0..1])
                } else if ('4'..='7').contains(&ch) {
                    // crossterm returns Control-4 thru 7 for \x1c thru \x1f
                    buf[0] = (buf[0] + 8) & 0x1f;
                    Some(&buf[0..1])
                } else {
                    Some(ch.encode_utf8(&mut buf).as_bytes())
                }
            } else {
                Some(ch.encode_utf8(&mut buf).as_bytes())
            }
        }
        _ => None,
    };

    key_str.map(|slice| slice.into())
}

struct RawModeGuard;

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        enable_raw_mode().into_diagnostic()?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            eprintln!("{e:#}")
        }
    }
}

/// Run the interactive monitor until CTRL+C, revocation, or stream end.
pub fn monitor(mut handle: DeviceHandle, log: MessageLog) -> Result<()> {
    println!("Commands:");
    println!("    CTRL+R    Reset chip");
    println!("    CTRL+C    Exit");
    println!();

    let _raw_mode = RawModeGuard::new()?;

    let stdout = stdout();
    let mut stdout = stdout.lock();

    let mut buff = [0; 1024];
    loop {
        if handle.is_revoked() {
            break;
        }

        let read_count = handle.transport().read(&mut buff)?;
        if read_count > 0 {
            let text = String::from_utf8_lossy(&buff[..read_count]).to_string();
            log.received(text);

            let data = normalize_line_endings(&buff[..read_count]);
            stdout.write_all(&data).into_diagnostic()?;
            stdout.flush().into_diagnostic()?;
        }

        if poll(Duration::from_secs(0)).into_diagnostic()? {
            if let Event::Key(key) = read().into_diagnostic()? {
                if key.modifiers.contains(KeyModifiers::CONTROL) {
                    match key.code {
                        KeyCode::Char('c') => break,
                        KeyCode::Char('r') => {
                            hard_reset(handle.transport())?;
                            sleep(Duration::from_millis(100));
                            continue;
                        }
                        _ => {}
                    }
                }

                if let Some(bytes) = handle_key_event(key) {
                    handle.transport().write_all(&bytes)?;
                    handle.transport().flush()?;
                    log.sent(String::from_utf8_lossy(&bytes).into_owned());
                }
            }
        }
    }

    // Dropping the handle hands the port back to the session.
    Ok(())
}
