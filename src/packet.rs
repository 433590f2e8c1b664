//! Fixed-size HID reports exchanged with the bootloader.

use std::fmt;

use crate::region::ERASED;
use crate::PACKET_SIZE;

/// First byte of every command report.
pub const STX: u8 = 0x0f;

/// Commands understood by the mikroBootloader firmware. The values are shared with the firmware.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Opcode {
    Sync = 0x01,
    Info = 0x02,
    Boot = 0x03,
    Reboot = 0x04,
    Write = 0x0b,
    Erase = 0x15,
}

impl Opcode {
    fn from_byte(code: u8) -> Option<Opcode> {
        Some(match code {
            0x01 => Opcode::Sync,
            0x02 => Opcode::Info,
            0x03 => Opcode::Boot,
            0x04 => Opcode::Reboot,
            0x0b => Opcode::Write,
            0x15 => Opcode::Erase,
            _ => return None,
        })
    }
}

/// A decoded command report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    Sync,
    Info,
    Boot,
    Reboot,
    Erase { address: u32, blocks: u16 },
    Write { address: u32, size: u16 },
}

/// One report as sent over the interrupt OUT endpoint.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Packet([u8; PACKET_SIZE]);

impl Packet {
    /// A command without arguments.
    pub fn command(opcode: Opcode) -> Self {
        let mut report = [0u8; PACKET_SIZE];
        report[0] = STX;
        report[1] = opcode as u8;
        Packet(report)
    }

    /// Erases `blocks` erase blocks starting at `address`.
    pub fn erase(address: u32, blocks: u16) -> Self {
        Self::with_address(Opcode::Erase, address, blocks)
    }

    /// Announces `size` bytes of data packets to be written from `address` on.
    pub fn write(address: u32, size: u16) -> Self {
        Self::with_address(Opcode::Write, address, size)
    }

    fn with_address(opcode: Opcode, address: u32, count: u16) -> Self {
        let mut packet = Self::command(opcode);
        packet.0[2..6].copy_from_slice(&address.to_le_bytes());
        packet.0[6..8].copy_from_slice(&count.to_le_bytes());
        packet
    }

    /// A raw data report. Data reports have no header; a short chunk is padded with erased bytes.
    pub fn data(chunk: &[u8]) -> Self {
        let mut report = [ERASED; PACKET_SIZE];
        let len = chunk.len().min(PACKET_SIZE);
        report[..len].copy_from_slice(&chunk[..len]);
        Packet(report)
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.0
    }

    /// Interprets a report as a command. Returns `None` for data reports and unknown opcodes.
    ///
    /// ```rust
    /// use mikroflash::{Command, Packet};
    ///
    /// let packet = Packet::erase(0x1d00_0000, 2);
    /// assert_eq!(
    ///     Packet::decode(packet.as_bytes()),
    ///     Some(Command::Erase { address: 0x1d00_0000, blocks: 2 })
    /// );
    /// ```
    pub fn decode(report: &[u8]) -> Option<Command> {
        if report.len() < 8 || report[0] != STX {
            return None;
        }
        let address = u32::from_le_bytes(report[2..6].try_into().ok()?);
        let count = u16::from_le_bytes([report[6], report[7]]);

        Some(match Opcode::from_byte(report[1])? {
            Opcode::Sync => Command::Sync,
            Opcode::Info => Command::Info,
            Opcode::Boot => Command::Boot,
            Opcode::Reboot => Command::Reboot,
            Opcode::Erase => Command::Erase {
                address,
                blocks: count,
            },
            Opcode::Write => Command::Write {
                address,
                size: count,
            },
        })
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_layout() {
        let packet = Packet::command(Opcode::Info);
        assert_eq!(packet.as_bytes()[..2], [0x0f, 0x02]);
        assert!(packet.as_bytes()[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn write_layout_is_little_endian() {
        let packet = Packet::write(0x1fc0_0000, 0x1800);
        assert_eq!(
            packet.as_bytes()[..8],
            [0x0f, 0x0b, 0x00, 0x00, 0xc0, 0x1f, 0x00, 0x18]
        );
        assert!(packet.as_bytes()[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn data_reports_are_padded_with_erased_bytes() {
        let packet = Packet::data(&[1, 2, 3]);
        assert_eq!(packet.as_bytes()[..4], [1, 2, 3, 0xff]);
        assert_eq!(Packet::decode(packet.as_bytes()), None);
    }
}
