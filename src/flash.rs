//! Architecture constants of the target family and the machine code stubs written into flash.

use crate::hex::ChecksumPolicy;
use crate::region::RegionKind;

/// Start of PIC32MZ program flash (physical address).
pub const PROGRAM_FLASH_BASE: u32 = 0x1d00_0000;

/// Start of PIC32MZ boot/configuration flash (physical address).
pub const CONFIG_FLASH_BASE: u32 = 0x1fc0_0000;

/// Default reset address of the PIC32 boot flash (KSEG1).
pub const RECOVERY_VECTOR: u32 = 0xbfc0_0050;

/// Encoding of the no-op the config preamble is padded with, as stored in flash.
pub const NOP: [u8; 4] = [0x00, 0x00, 0x00, 0x70];

/// Length of a [`jump_stub`] in bytes.
pub const STUB_LEN: usize = 16;

/// Whether the boot vector page near the end of program flash is written.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BootVectorPolicy {
    /// Never write the page.
    #[default]
    Disabled,

    /// Write the page if the bootloader's reported start address leaves room for it.
    Enabled,
}

/// Memory layout and flashing parameters for one target family. The default describes the
/// PIC32MZ devices the mikroBootloader ships for.
#[derive(Clone, Debug)]
pub struct TargetConfig {
    /// First address classified as program flash.
    pub program_flash_base: u32,

    /// First address classified as configuration flash.
    pub config_flash_base: u32,

    /// Records closer than this to an existing region of the same kind are merged into it.
    pub region_gap: u32,

    /// Maximum number of regions an image may be split into.
    pub max_regions: usize,

    /// Distance of the boot vector page from the end of program flash.
    pub boot_vector_reserve: u32,

    /// Jump target of the stub at the end of the boot vector page.
    pub recovery_vector: u32,

    pub boot_vector_page: BootVectorPolicy,

    /// Number of write blocks sent to configuration flash.
    pub config_write_blocks: u16,

    /// Bytes at the start of configuration flash reserved for the first instruction and no-ops.
    pub config_preamble_len: usize,

    pub checksum: ChecksumPolicy,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            program_flash_base: PROGRAM_FLASH_BASE,
            config_flash_base: CONFIG_FLASH_BASE,
            region_gap: 0x400,
            max_regions: 16,
            boot_vector_reserve: 0x1_0000,
            recovery_vector: RECOVERY_VECTOR,
            boot_vector_page: BootVectorPolicy::default(),
            config_write_blocks: 3,
            config_preamble_len: 64,
            checksum: ChecksumPolicy::default(),
        }
    }
}

impl TargetConfig {
    /// Classifies an absolute address. Addresses below program flash belong to no region.
    pub fn classify(&self, address: u32) -> Option<RegionKind> {
        if address >= self.config_flash_base {
            Some(RegionKind::ConfigFlash)
        } else if address >= self.program_flash_base {
            Some(RegionKind::ProgramFlash)
        } else {
            None
        }
    }

    /// Base address flattened regions of a kind are anchored at.
    pub fn base_of(&self, kind: RegionKind) -> u32 {
        match kind {
            RegionKind::ProgramFlash | RegionKind::BootVectorPage => self.program_flash_base,
            RegionKind::ConfigFlash => self.config_flash_base,
        }
    }
}

/// Maps a physical or cached address to its uncached KSEG1 alias, which is what jumps use.
pub fn kseg1(address: u32) -> u32 {
    (address & 0x1fff_ffff) | 0xa000_0000
}

/// Generates `lui $30, hi; ori $30, $30, lo; jr $30; nop` jumping to `target`.
///
/// ```rust
/// use mikroflash::jump_stub;
///
/// assert_eq!(
///     jump_stub(0xbd0f_4000),
///     [0x0f, 0xbd, 0x1e, 0x3c, 0x00, 0x40, 0xde, 0x37, 0x08, 0x00, 0xc0, 0x03, 0x00, 0x00, 0x00, 0x70]
/// );
/// ```
pub fn jump_stub(target: u32) -> [u8; STUB_LEN] {
    let lui = 0x3c1e_0000 | (target >> 16);
    let ori = 0x37de_0000 | (target & 0xffff);
    let jr = 0x03c0_0008u32;

    let mut stub = [0u8; STUB_LEN];
    stub[0..4].copy_from_slice(&lui.to_le_bytes());
    stub[4..8].copy_from_slice(&ori.to_le_bytes());
    stub[8..12].copy_from_slice(&jr.to_le_bytes());
    stub[12..16].copy_from_slice(&NOP);
    stub
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_stub_matches_default_boot_vector() {
        assert_eq!(
            jump_stub(RECOVERY_VECTOR),
            [
                0xc0, 0xbf, 0x1e, 0x3c, 0x50, 0x00, 0xde, 0x37, 0x08, 0x00, 0xc0, 0x03, 0x00, 0x00,
                0x00, 0x70
            ]
        );
    }

    #[test]
    fn kseg1_alias() {
        assert_eq!(kseg1(0x1d0f_4000), 0xbd0f_4000);
        assert_eq!(kseg1(0x9d1f_4000), 0xbd1f_4000);
        assert_eq!(kseg1(0xbfc0_0000), 0xbfc0_0000);
    }

    #[test]
    fn classify_addresses() {
        let config = TargetConfig::default();
        assert_eq!(config.classify(0x1cff_ffff), None);
        assert_eq!(config.classify(0x1d00_0000), Some(RegionKind::ProgramFlash));
        assert_eq!(config.classify(0x1fbf_ffff), Some(RegionKind::ProgramFlash));
        assert_eq!(config.classify(0x1fc0_0000), Some(RegionKind::ConfigFlash));
    }
}
