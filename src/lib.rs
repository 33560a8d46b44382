//! A library and command-line tool for building sketches and flashing them
//! to Espressif and Arduino family development boards.
//!
//! The heart of the crate is the device session controller: a single
//! serial-connected device is shared between two competing consumers, the
//! interactive serial console and the firmware flasher. The [Session] type
//! arbitrates exclusive ownership of the open port, the [ConsoleReader]
//! drains incoming bytes into a message log, and the [FlashSequencer]
//! drives the build, erase, write and reset workflow.
//!
//! Sketch compilation is pluggable behind the [Compiler] trait; the
//! built-in [MockCompiler] simulates a build and produces a synthetic
//! artifact. The bootloader serial protocol sits behind the
//! [BootloaderProtocol] trait, with [RomClient] providing a SLIP-framed
//! client for the ROM loader.
//!
//! [Session]: session::Session
//! [ConsoleReader]: console::ConsoleReader
//! [FlashSequencer]: flasher::FlashSequencer
//! [Compiler]: compiler::Compiler
//! [MockCompiler]: compiler::MockCompiler
//! [BootloaderProtocol]: protocol::BootloaderProtocol
//! [RomClient]: protocol::RomClient

pub mod board;
pub mod cli;
pub mod compiler;
pub mod connection;
pub mod console;
pub mod flasher;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod sketch;
pub mod store;

mod error;

pub use self::error::{Error, HandshakeError, StoreError};
