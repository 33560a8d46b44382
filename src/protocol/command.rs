//! Bootloader command framing
//!
//! Commands are encoded into the request format understood by the
//! Espressif serial bootloader: a direction byte, the command opcode, a
//! little-endian payload size and checksum, then the payload itself.
//! The whole packet is SLIP-framed by the caller before hitting the
//! wire.

use std::{io::Write, time::Duration};

use strum::Display;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

/// XOR checksum used by the data commands.
pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Opcodes of the bootloader commands this client issues.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    ReadReg = 0x0a,
    FlashDeflateBegin = 0x10,
    FlashDeflateData = 0x11,
    FlashDeflateEnd = 0x12,
    FlashMd5 = 0x13,
    EraseRegion = 0xd1,
}

impl CommandType {
    /// How long to wait for a response to this command.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Like [CommandType::timeout], but scaled for commands whose
    /// duration depends on the amount of flash affected.
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                DEFAULT_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }

        match self {
            CommandType::FlashBegin
            | CommandType::FlashDeflateBegin
            | CommandType::EraseRegion => calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size),
            CommandType::FlashData | CommandType::FlashDeflateData => {
                calc_timeout(WRITE_TIMEOUT_PER_MB, size)
            }
            _ => self.timeout(),
        }
    }
}

/// A single bootloader command with its payload.
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    Sync,
    ReadReg {
        address: u32,
    },
    FlashDeflateBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashDeflateData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashDeflateEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseRegion {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::FlashDeflateBegin { .. } => CommandType::FlashDeflateBegin,
            Command::FlashDeflateData { .. } => CommandType::FlashDeflateData,
            Command::FlashDeflateEnd { .. } => CommandType::FlashDeflateEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
        }
    }

    /// Encode the command into the (unframed) request packet format.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                write_basic(writer, &[if reboot { 0 } else { 1 }], 0)?;
            }
            Command::Sync => {
                write_basic(
                    writer,
                    &[
                        0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                    ],
                    0,
                )?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::FlashDeflateBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::FlashDeflateData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::FlashDeflateEnd { reboot } => {
                write_basic(writer, &[if reboot { 0 } else { 1 }], 0)?;
            }
            Command::FlashMd5 { offset, size } => {
                let mut data = Vec::with_capacity(16);
                data.extend_from_slice(&offset.to_le_bytes());
                data.extend_from_slice(&size.to_le_bytes());
                data.extend_from_slice(&0u32.to_le_bytes());
                data.extend_from_slice(&0u32.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
            Command::EraseRegion { offset, size } => {
                let mut data = Vec::with_capacity(8);
                data.extend_from_slice(&offset.to_le_bytes());
                data.extend_from_slice(&size.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
        }

        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)?;

    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
) -> std::io::Result<()> {
    let mut data = Vec::with_capacity(16);
    data.extend_from_slice(&size.to_le_bytes());
    data.extend_from_slice(&blocks.to_le_bytes());
    data.extend_from_slice(&block_size.to_le_bytes());
    data.extend_from_slice(&offset.to_le_bytes());

    write_basic(writer, &data, 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    let pad_length = pad_to.saturating_sub(block_data.len());
    let total = (block_data.len() + pad_length) as u32;

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check ^= pad_byte;
    }

    // Header: data length, block sequence number, two reserved words.
    writer.write_all(&(16 + total as u16).to_le_bytes())?;
    writer.write_all(&(check as u32).to_le_bytes())?;
    writer.write_all(&total.to_le_bytes())?;
    writer.write_all(&sequence.to_le_bytes())?;
    writer.write_all(&0u32.to_le_bytes())?;
    writer.write_all(&0u32.to_le_bytes())?;

    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_command_encodes_the_esptool_preamble() {
        let mut packet = Vec::new();
        Command::Sync.write(&mut packet).unwrap();

        // Direction, opcode, size, checksum, then 0x07 0x07 0x12 0x20
        // followed by 32 bytes of 0x55.
        assert_eq!(&packet[..2], &[0x00, 0x08]);
        assert_eq!(&packet[2..4], &36u16.to_le_bytes());
        assert_eq!(&packet[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert_eq!(&packet[12..], &[0x55; 32]);
    }

    #[test]
    fn data_command_pads_and_checksums_the_block() {
        let mut packet = Vec::new();
        Command::FlashData {
            data: &[0xAA, 0xBB],
            pad_to: 4,
            pad_byte: 0xFF,
            sequence: 7,
        }
        .write(&mut packet)
        .unwrap();

        assert_eq!(&packet[..2], &[0x00, 0x03]);
        // Payload is the 16 byte block header plus the padded block.
        assert_eq!(&packet[2..4], &20u16.to_le_bytes());
        let expected = CHECKSUM_INIT ^ 0xAA ^ 0xBB ^ 0xFF ^ 0xFF;
        assert_eq!(&packet[4..8], &(expected as u32).to_le_bytes());
        assert_eq!(&packet[8..12], &4u32.to_le_bytes());
        assert_eq!(&packet[12..16], &7u32.to_le_bytes());
        assert_eq!(&packet[24..], &[0xAA, 0xBB, 0xFF, 0xFF]);
    }

    #[test]
    fn size_scaled_timeouts_never_drop_below_the_default() {
        assert_eq!(
            CommandType::EraseRegion.timeout_for_size(1024),
            Duration::from_secs(3)
        );
        assert!(
            CommandType::FlashData.timeout_for_size(4 * 1024 * 1024) > Duration::from_secs(3)
        );
    }
}
