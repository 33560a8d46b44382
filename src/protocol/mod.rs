//! Talk to a device's serial bootloader
//!
//! [RomClient] implements the SLIP-framed command protocol spoken by the
//! Espressif ROM bootloader: sync, register reads, region erase, block
//! writes (raw or deflate-compressed) and MD5 verification. The
//! [BootloaderProtocol] trait is the seam the flash sequencer works
//! against, so tests can substitute a scripted implementation.

use std::{
    io::{self, Write},
    thread::sleep,
    time::Duration,
};

use flate2::{write::ZlibEncoder, Compression};
use log::debug;
use md5::{Digest, Md5};
use slip_codec::SlipDecoder;

use self::encoder::SlipEncoder;
use crate::{
    connection::Transport,
    error::{Error, HandshakeError},
};

mod command;
mod encoder;

pub use self::command::{Command, CommandType};

/// Block size used by the flash write commands.
pub const FLASH_WRITE_SIZE: usize = 0x400;

/// Register whose contents identify the attached chip family.
const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;

const MAX_SYNC_ATTEMPTS: usize = 5;
const MAX_RESPONSE_READS: usize = 100;

/// Progress updates during a flash write.
pub trait ProgressCallbacks: Send {
    /// A write of `total` blocks at `addr` is starting.
    fn init(&mut self, addr: u32, total: usize);
    /// `current` blocks have been written so far.
    fn update(&mut self, current: usize);
    /// The write has completed.
    fn finish(&mut self);
}

/// A [ProgressCallbacks] that reports nothing.
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _addr: u32, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}

/// The operations the flash sequencer needs from a bootloader.
pub trait BootloaderProtocol: Send {
    /// Synchronize with the bootloader after a reset into download mode.
    fn sync(&mut self, transport: &mut dyn Transport) -> Result<(), Error>;

    /// Read the chip-detect magic register.
    fn chip_id(&mut self, transport: &mut dyn Transport) -> Result<u32, Error>;

    /// Erase `size` bytes of flash starting at `offset`.
    fn erase_region(
        &mut self,
        transport: &mut dyn Transport,
        offset: u32,
        size: u32,
    ) -> Result<(), Error>;

    /// Write `data` to flash at `offset`, optionally deflate-compressed
    /// in transit.
    fn write_region(
        &mut self,
        transport: &mut dyn Transport,
        offset: u32,
        data: &[u8],
        compressed: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;

    /// Ask the device for an MD5 digest of the written region and
    /// compare it against the host-side digest of `data`.
    fn verify(
        &mut self,
        transport: &mut dyn Transport,
        offset: u32,
        data: &[u8],
    ) -> Result<(), Error>;
}

#[derive(Debug, Copy, Clone)]
enum ResponseValue {
    U32(u32),
    U128(u128),
}

/// A decoded response packet.
#[derive(Debug, Copy, Clone)]
struct Response {
    return_op: u8,
    value: ResponseValue,
    /// Non-zero when the command failed.
    status: u8,
    /// ROM error code, only meaningful when `status` is non-zero.
    error: u8,
}

/// Client for the ROM bootloader's serial protocol.
pub struct RomClient {
    decoder: SlipDecoder,
}

impl RomClient {
    pub fn new() -> Self {
        RomClient {
            decoder: SlipDecoder::new(),
        }
    }

    /// SLIP-frame a command and push it down the transport.
    fn write_command(
        &mut self,
        transport: &mut dyn Transport,
        command: Command<'_>,
    ) -> Result<(), HandshakeError> {
        let ty = command.command_type();
        debug!("writing command: {ty:?}");

        let mut frame = Vec::with_capacity(64);
        let mut encoder = SlipEncoder::new(&mut frame).map_err(|e| HandshakeError::Io(ty, e))?;
        command
            .write(&mut encoder)
            .map_err(|e| HandshakeError::Io(ty, e))?;
        encoder.finish().map_err(|e| HandshakeError::Io(ty, e))?;

        transport.write_all(&frame).map_err(|e| io_err(e, ty))?;
        transport.flush().map_err(|e| io_err(e, ty))?;

        Ok(())
    }

    /// Decode the next SLIP frame into a response packet, or `None` for
    /// frames too short or oddly sized to be one.
    fn read_response(
        &mut self,
        transport: &mut dyn Transport,
        command: CommandType,
    ) -> Result<Option<Response>, HandshakeError> {
        let mut packet = Vec::with_capacity(1024);
        let mut reader = TransportReader(transport);
        self.decoder
            .decode(&mut reader, &mut packet)
            .map_err(|e| HandshakeError::from_slip(e, command))?;

        if packet.len() < 10 || packet[0] != 0x01 {
            return Ok(None);
        }

        // Response sizes are fixed per command: 10 (stub) or 12 (ROM)
        // for most commands, 26 (stub) or 44 (ROM) for the MD5 command.
        // The two trailing status bytes sit after a ROM-only reserved
        // pair in the longer variants.
        let status_len = if packet.len() == 10 || packet.len() == 26 {
            2
        } else {
            4
        };

        let value = match packet.len() {
            10 | 12 => ResponseValue::U32(u32::from_le_bytes(
                packet[4..][..4].try_into().unwrap_or_default(),
            )),
            44 => {
                // MD5 as ASCII hex.
                let digest = std::str::from_utf8(&packet[8..][..32])
                    .ok()
                    .and_then(|text| u128::from_str_radix(text, 16).ok())
                    .ok_or(HandshakeError::Framing)?;
                ResponseValue::U128(digest)
            }
            26 => {
                // MD5 as big-endian bytes.
                ResponseValue::U128(u128::from_be_bytes(
                    packet[8..][..16].try_into().unwrap_or_default(),
                ))
            }
            _ => return Ok(None),
        };

        Ok(Some(Response {
            return_op: packet[1],
            value,
            status: packet[packet.len() - status_len],
            error: packet[packet.len() - status_len + 1],
        }))
    }

    /// Write a command and wait for its matching response.
    fn command(
        &mut self,
        transport: &mut dyn Transport,
        command: Command<'_>,
    ) -> Result<ResponseValue, Error> {
        let ty = command.command_type();
        self.write_command(transport, command)?;

        for _ in 0..MAX_RESPONSE_READS {
            match self.read_response(transport, ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return if response.status != 0 {
                        Err(HandshakeError::Rom {
                            command: ty,
                            code: response.error,
                        }
                        .into())
                    } else {
                        Ok(response.value)
                    };
                }
                _ => continue,
            }
        }

        Err(HandshakeError::NoResponse(ty).into())
    }

    /// One sync round: send the sync preamble and drain the burst of
    /// responses the bootloader answers with.
    fn sync_attempt(&mut self, transport: &mut dyn Transport) -> Result<(), HandshakeError> {
        self.write_command(transport, Command::Sync)?;
        sleep(Duration::from_millis(10));

        let mut synced = false;
        for _ in 0..8 {
            match self.read_response(transport, CommandType::Sync) {
                Ok(Some(response)) if response.return_op == CommandType::Sync as u8 => {
                    if response.status != 0 {
                        return Err(HandshakeError::Rom {
                            command: CommandType::Sync,
                            code: response.error,
                        });
                    }
                    synced = true;
                }
                Ok(_) => continue,
                Err(HandshakeError::Timeout(_)) if synced => break,
                Err(err) => return Err(err),
            }
        }

        if synced {
            Ok(())
        } else {
            Err(HandshakeError::NoResponse(CommandType::Sync))
        }
    }

    fn write_raw(
        &mut self,
        transport: &mut dyn Transport,
        offset: u32,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let blocks = data.len().div_ceil(FLASH_WRITE_SIZE);
        with_timeout(
            transport,
            CommandType::FlashBegin.timeout_for_size(data.len() as u32),
            |t| {
                self.command(
                    t,
                    Command::FlashBegin {
                        size: data.len() as u32,
                        blocks: blocks as u32,
                        block_size: FLASH_WRITE_SIZE as u32,
                        offset,
                    },
                )
                .map(drop)
            },
        )?;

        progress.init(offset, blocks);
        for (sequence, block) in data.chunks(FLASH_WRITE_SIZE).enumerate() {
            with_timeout(
                transport,
                CommandType::FlashData.timeout_for_size(FLASH_WRITE_SIZE as u32),
                |t| {
                    self.command(
                        t,
                        Command::FlashData {
                            data: block,
                            pad_to: FLASH_WRITE_SIZE,
                            pad_byte: 0xFF,
                            sequence: sequence as u32,
                        },
                    )
                    .map(drop)
                },
            )?;
            progress.update(sequence + 1);
        }
        progress.finish();

        with_timeout(transport, CommandType::FlashEnd.timeout(), |t| {
            // Stay in the bootloader so the region can still be verified.
            self.command(t, Command::FlashEnd { reboot: false }).map(drop)
        })
    }

    fn write_deflated(
        &mut self,
        transport: &mut dyn Transport,
        offset: u32,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(data).map_err(Error::Write)?;
        let compressed = zlib.finish().map_err(Error::Write)?;

        debug!(
            "compressed {} bytes to {} for transfer",
            data.len(),
            compressed.len()
        );

        let blocks = compressed.len().div_ceil(FLASH_WRITE_SIZE);
        with_timeout(
            transport,
            CommandType::FlashDeflateBegin.timeout_for_size(data.len() as u32),
            |t| {
                self.command(
                    t,
                    Command::FlashDeflateBegin {
                        size: data.len() as u32,
                        blocks: blocks as u32,
                        block_size: FLASH_WRITE_SIZE as u32,
                        offset,
                    },
                )
                .map(drop)
            },
        )?;

        progress.init(offset, blocks);
        for (sequence, block) in compressed.chunks(FLASH_WRITE_SIZE).enumerate() {
            with_timeout(
                transport,
                CommandType::FlashDeflateData.timeout_for_size(FLASH_WRITE_SIZE as u32),
                |t| {
                    self.command(
                        t,
                        Command::FlashDeflateData {
                            data: block,
                            pad_to: FLASH_WRITE_SIZE,
                            pad_byte: 0xFF,
                            sequence: sequence as u32,
                        },
                    )
                    .map(drop)
                },
            )?;
            progress.update(sequence + 1);
        }
        progress.finish();

        with_timeout(transport, CommandType::FlashDeflateEnd.timeout(), |t| {
            self.command(t, Command::FlashDeflateEnd { reboot: false })
                .map(drop)
        })
    }
}

impl Default for RomClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BootloaderProtocol for RomClient {
    fn sync(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        for attempt in 1..=MAX_SYNC_ATTEMPTS {
            transport.flush()?;
            let result = with_timeout(transport, CommandType::Sync.timeout(), |t| {
                self.sync_attempt(t).map_err(Error::from)
            });
            match result {
                Ok(()) => {
                    debug!("synced with the bootloader on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => debug!("sync attempt {attempt} failed: {err}"),
            }
        }

        Err(HandshakeError::SyncFailed.into())
    }

    fn chip_id(&mut self, transport: &mut dyn Transport) -> Result<u32, Error> {
        let value = with_timeout(transport, CommandType::ReadReg.timeout(), |t| {
            self.command(
                t,
                Command::ReadReg {
                    address: CHIP_DETECT_MAGIC_REG,
                },
            )
        })?;

        match value {
            ResponseValue::U32(magic) => Ok(magic),
            ResponseValue::U128(_) => Err(HandshakeError::NoResponse(CommandType::ReadReg).into()),
        }
    }

    fn erase_region(
        &mut self,
        transport: &mut dyn Transport,
        offset: u32,
        size: u32,
    ) -> Result<(), Error> {
        debug!("erasing {size:#x} bytes at {offset:#x}");
        with_timeout(
            transport,
            CommandType::EraseRegion.timeout_for_size(size),
            |t| self.command(t, Command::EraseRegion { offset, size }).map(drop),
        )
    }

    fn write_region(
        &mut self,
        transport: &mut dyn Transport,
        offset: u32,
        data: &[u8],
        compressed: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        debug!("writing {:#x} bytes at {offset:#x}", data.len());
        if compressed {
            self.write_deflated(transport, offset, data, progress)
        } else {
            self.write_raw(transport, offset, data, progress)
        }
    }

    fn verify(
        &mut self,
        transport: &mut dyn Transport,
        offset: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let size = data.len() as u32;
        let value = with_timeout(
            transport,
            CommandType::FlashMd5.timeout_for_size(size),
            |t| self.command(t, Command::FlashMd5 { offset, size }),
        )?;

        let device = match value {
            ResponseValue::U128(digest) => digest,
            ResponseValue::U32(_) => {
                return Err(HandshakeError::NoResponse(CommandType::FlashMd5).into())
            }
        };
        let host = u128::from_be_bytes(Md5::digest(data).into());

        if device == host {
            debug!("flash digest matches: {host:032x}");
            Ok(())
        } else {
            Err(HandshakeError::DigestMismatch { device, host }.into())
        }
    }
}

/// Run `f` with the transport's read timeout temporarily replaced.
fn with_timeout<T, F>(transport: &mut dyn Transport, timeout: Duration, f: F) -> Result<T, Error>
where
    F: FnOnce(&mut dyn Transport) -> Result<T, Error>,
{
    let old_timeout = transport.timeout();
    transport.set_timeout(timeout)?;
    let result = f(transport);
    transport.set_timeout(old_timeout)?;

    result
}

fn io_err(err: Error, command: CommandType) -> HandshakeError {
    match err {
        Error::Read(io) | Error::Write(io) => HandshakeError::Io(command, io),
        other => HandshakeError::Io(command, io::Error::other(other)),
    }
}

/// Adapter so the SLIP decoder can pull from a [Transport]. A zero-byte
/// read means the port timed out, which the decoder must see as an
/// error rather than end-of-stream.
struct TransportReader<'a>(&'a mut dyn Transport);

impl io::Read for TransportReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "serial read timed out",
            )),
            Ok(n) => Ok(n),
            Err(Error::Read(io)) => Err(io),
            Err(other) => Err(io::Error::other(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Transport that records writes and replays canned response bytes.
    struct LoopbackTransport {
        written: Vec<u8>,
        responses: VecDeque<u8>,
        timeout: Duration,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            LoopbackTransport {
                written: Vec::new(),
                responses: VecDeque::new(),
                timeout: Duration::from_millis(10),
            }
        }

        /// Queue a SLIP-framed response packet.
        fn respond(&mut self, packet: &[u8]) {
            self.responses.push_back(0xC0);
            self.responses.extend(packet);
            self.responses.push_back(0xC0);
        }
    }

    impl Transport for LoopbackTransport {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            let mut count = 0;
            while count < buf.len() {
                match self.responses.pop_front() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
            self.written.extend_from_slice(data);
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
            Some("loopback".into())
        }
    }

    fn ok_response(op: u8) -> [u8; 10] {
        [0x01, op, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    }

    #[test]
    fn sync_gives_up_on_a_silent_device() {
        let mut transport = LoopbackTransport::new();

        let mut client = RomClient::new();
        let err = client.sync(&mut transport).unwrap_err();

        // Every attempt times out rather than blocking, and the
        // transport's own read timeout is restored afterwards.
        assert!(matches!(err, Error::Handshake(HandshakeError::SyncFailed)));
        assert_eq!(transport.timeout(), Duration::from_millis(10));
    }

    #[test]
    fn sync_accepts_a_well_formed_response_burst() {
        let mut transport = LoopbackTransport::new();
        transport.respond(&ok_response(0x08));
        transport.respond(&ok_response(0x08));

        let mut client = RomClient::new();
        client.sync(&mut transport).unwrap();

        // The frame on the wire starts with the SLIP delimiter and
        // carries the 0x55 sync run.
        assert_eq!(transport.written[0], 0xC0);
        assert!(transport.written.windows(4).any(|w| w == [0x55; 4]));
    }

    #[test]
    fn rom_rejection_is_surfaced_with_its_error_code() {
        let mut transport = LoopbackTransport::new();
        let mut packet = ok_response(0xd1);
        packet[8] = 0x01;
        packet[9] = 0x05;
        transport.respond(&packet);

        let mut client = RomClient::new();
        let err = client.erase_region(&mut transport, 0, 1024).unwrap_err();

        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::Rom {
                command: CommandType::EraseRegion,
                code: 0x05,
            })
        ));
    }

    #[test]
    fn chip_id_returns_the_magic_register_value() {
        let mut transport = LoopbackTransport::new();
        let mut packet = ok_response(0x0a);
        packet[4..8].copy_from_slice(&0x00F0_1D83u32.to_le_bytes());
        transport.respond(&packet);

        let mut client = RomClient::new();
        let magic = client.chip_id(&mut transport).unwrap();

        assert_eq!(magic, 0x00F0_1D83);
    }

    #[test]
    fn verify_flags_a_digest_mismatch() {
        let data = vec![0xAB; 64];
        let device_digest = [0u8; 16];

        let mut packet = vec![0x01, 0x13, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00];
        packet.extend_from_slice(&device_digest);
        packet.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(packet.len(), 26);

        let mut transport = LoopbackTransport::new();
        transport.respond(&packet);

        let mut client = RomClient::new();
        let err = client.verify(&mut transport, 0, &data).unwrap_err();

        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::DigestMismatch { device: 0, .. })
        ));
    }

    #[test]
    fn verify_accepts_a_matching_digest() {
        let data = vec![0x5A; 128];
        let digest: [u8; 16] = Md5::digest(&data).into();

        let mut packet = vec![0x01, 0x13, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00];
        packet.extend_from_slice(&digest);
        packet.extend_from_slice(&[0x00, 0x00]);

        let mut transport = LoopbackTransport::new();
        transport.respond(&packet);

        let mut client = RomClient::new();
        client.verify(&mut transport, 0, &data).unwrap();
    }

    #[test]
    fn raw_write_sends_begin_data_and_end() {
        let data = vec![0x11; FLASH_WRITE_SIZE + 1];

        let mut transport = LoopbackTransport::new();
        transport.respond(&ok_response(0x02));
        transport.respond(&ok_response(0x03));
        transport.respond(&ok_response(0x03));
        transport.respond(&ok_response(0x04));

        let mut client = RomClient::new();
        client
            .write_region(&mut transport, 0x1_0000, &data, false, &mut NoProgress)
            .unwrap();
    }
}
