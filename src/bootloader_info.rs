//! The capability block the bootloader sends back in answer to an info request.

use std::fmt;

use crate::error::{Error, Result};

/// Length of the fixed part of the capability block.
pub const BOOT_INFO_LEN: usize = 53;

const MCU_TYPE: usize = 2;
const MCU_SIZE: usize = 8;
const ERASE_BLOCK: usize = 12 + 2;
const WRITE_BLOCK: usize = 16 + 2;
const BOOT_REV: usize = 20 + 2;
const BOOT_START: usize = 24 + 4;
const DEVICE_DESCRIPTOR: usize = 32 + 1;
const DEVICE_DESCRIPTOR_LEN: usize = 20;

/// Microcontroller family reported by the bootloader.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum McuKind {
    Pic16,
    Pic18,
    Pic18Fj,
    Pic24,
    DsPic,
    Pic32,
    Arm,
    Unknown(u8),
}

impl From<u8> for McuKind {
    fn from(code: u8) -> McuKind {
        match code {
            1 => McuKind::Pic16,
            2 => McuKind::Pic18,
            3 => McuKind::Pic18Fj,
            4 => McuKind::Pic24,
            10 => McuKind::DsPic,
            20 => McuKind::Pic32,
            30 => McuKind::Arm,
            other => McuKind::Unknown(other),
        }
    }
}

impl fmt::Display for McuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McuKind::Pic16 => f.write_str("PIC16"),
            McuKind::Pic18 => f.write_str("PIC18"),
            McuKind::Pic18Fj => f.write_str("PIC18FJ"),
            McuKind::Pic24 => f.write_str("PIC24"),
            McuKind::DsPic => f.write_str("dsPIC"),
            McuKind::Pic32 => f.write_str("PIC32"),
            McuKind::Arm => f.write_str("ARM"),
            McuKind::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}

/// Capabilities read back from the bootloader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootInfo {
    pub mcu_kind: McuKind,

    /// Size of the device's program flash in bytes.
    pub mcu_flash_size: u32,

    /// Smallest unit of flash which can be erased.
    pub erase_block_size: u16,

    /// Smallest unit of flash the firmware accepts in one write.
    pub write_block_size: u16,

    pub boot_revision: u16,

    /// Address the bootloader itself starts at.
    pub boot_flash_start: u32,

    /// Device descriptor string, usually containing the board name.
    pub device_descriptor: String,
}

fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    // Bounds are checked by the caller against BOOT_INFO_LEN
    u32::from_le_bytes(buffer[offset..offset + 4].try_into().unwrap_or_default())
}

impl BootInfo {
    /// Decodes the response to an info command.
    ///
    /// ```rust
    /// use mikroflash::{BootInfo, Error};
    ///
    /// let result = BootInfo::decode(&[0u8; 16]);
    /// assert!(matches!(result, Err(Error::TruncatedResponse { expected: 53, actual: 16 })));
    /// ```
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < BOOT_INFO_LEN {
            return Err(Error::TruncatedResponse {
                expected: BOOT_INFO_LEN,
                actual: buffer.len(),
            });
        }

        let descriptor = &buffer[DEVICE_DESCRIPTOR..DEVICE_DESCRIPTOR + DEVICE_DESCRIPTOR_LEN];
        let descriptor = descriptor
            .split(|b| *b == 0)
            .next()
            .unwrap_or_default();

        Ok(BootInfo {
            mcu_kind: buffer[MCU_TYPE].into(),
            mcu_flash_size: read_u32(buffer, MCU_SIZE),
            erase_block_size: read_u16(buffer, ERASE_BLOCK),
            write_block_size: read_u16(buffer, WRITE_BLOCK),
            boot_revision: read_u16(buffer, BOOT_REV),
            boot_flash_start: read_u32(buffer, BOOT_START),
            device_descriptor: String::from_utf8_lossy(descriptor).into_owned(),
        })
    }
}

impl fmt::Display for BootInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MCU type: {}", self.mcu_kind)?;
        writeln!(f, "Device descriptor: {}", self.device_descriptor)?;
        writeln!(f, "Bootloader revision: 0x{:04x}", self.boot_revision)?;
        writeln!(f, "Bootloader start address: 0x{:08x}", self.boot_flash_start)?;
        writeln!(f, "Flash size: {} KiB", self.mcu_flash_size / 1024)?;
        writeln!(f, "Erase block size: 0x{:x}", self.erase_block_size)?;
        writeln!(f, "Write block size: 0x{:x}", self.write_block_size)
    }
}
