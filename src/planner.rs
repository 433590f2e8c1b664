//! Erase and write geometry for a region.

use crate::bootloader_info::BootInfo;
use crate::error::{Error, Result};
use crate::region::MemoryRegion;
use crate::PACKET_SIZE;

/// How a region is erased and written. Flashing happens page by page: every page is erased with
/// one erase command and filled with one write command followed by its data packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlashPlan {
    /// Address of the first erase block.
    pub erase_start: u32,

    /// Number of erase blocks (pages) covered. Never zero.
    pub erase_block_count: u16,

    pub erase_block_size: u16,

    /// Address the first write command targets.
    pub write_base: u32,

    /// Bytes sent over all pages.
    pub total_write_bytes: u32,

    /// Bytes announced by each write command.
    pub page_write_bytes: u16,

    /// Data packets sent after each write command.
    pub packets_per_page: u16,

    /// Data packets sent over all pages.
    pub packet_count: u32,
}

/// One erase-write cycle of a [`FlashPlan`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageWrite {
    pub erase_address: u32,
    pub write_address: u32,
    pub write_bytes: u16,

    /// Offset of the page's first byte in the region buffer.
    pub offset: usize,

    pub packets: u16,
}

fn div_ceil(value: u32, divisor: u32) -> u32 {
    value / divisor + u32::from(value % divisor != 0)
}

/// Computes [`FlashPlan`]s for regions, given the device's block sizes.
pub struct FlashPlanner;

impl FlashPlanner {
    /// Plans flashing `region`, which is expected to start on an erase block boundary.
    ///
    /// A region fitting into one erase block is written rounded up to whole write blocks. Larger
    /// regions are written as full erase blocks, one page at a time.
    ///
    /// ```rust
    /// use mikroflash::{BootInfo, FlashPlanner, McuKind, MemoryRegion, RegionKind};
    ///
    /// let info = BootInfo {
    ///     mcu_kind: McuKind::Pic32,
    ///     mcu_flash_size: 0x10_0000,
    ///     erase_block_size: 0x4000,
    ///     write_block_size: 0x800,
    ///     boot_revision: 0,
    ///     boot_flash_start: 0x1d0f_4000,
    ///     device_descriptor: String::new(),
    /// };
    /// let region = MemoryRegion::erased(RegionKind::ProgramFlash, 0x1d00_0000, 0x1d00_0903);
    /// let plan = FlashPlanner::plan(&region, &info).unwrap();
    /// assert_eq!(plan.erase_block_count, 1);
    /// assert_eq!(plan.total_write_bytes, 0x1000);
    /// assert_eq!(plan.packet_count, 0x1000 / 64);
    /// ```
    pub fn plan(region: &MemoryRegion, info: &BootInfo) -> Result<FlashPlan> {
        let erase_block = u32::from(info.erase_block_size);
        let write_block = u32::from(info.write_block_size);
        if erase_block == 0 || write_block == 0 {
            return Err(Error::InvalidGeometry);
        }

        let size = region.len() as u32;
        let pages = div_ceil(size, erase_block).max(1);
        let erase_block_count = u16::try_from(pages).map_err(|_| Error::PlanTooLarge(size))?;

        let page_write_bytes = if pages == 1 {
            div_ceil(size, write_block).max(1) * write_block
        } else {
            erase_block
        };
        let page_write_bytes =
            u16::try_from(page_write_bytes).map_err(|_| Error::PlanTooLarge(page_write_bytes))?;
        let packets_per_page = div_ceil(u32::from(page_write_bytes), PACKET_SIZE as u32) as u16;

        Ok(FlashPlan {
            erase_start: region.start(),
            erase_block_count,
            erase_block_size: info.erase_block_size,
            write_base: region.start(),
            total_write_bytes: u32::from(page_write_bytes) * pages,
            page_write_bytes,
            packets_per_page,
            packet_count: u32::from(packets_per_page) * pages,
        })
    }
}

impl FlashPlan {
    /// Number of erase-write cycles.
    pub fn pages(&self) -> u16 {
        self.erase_block_count
    }

    /// Geometry of page `index`, counting from zero.
    pub fn page(&self, index: u16) -> PageWrite {
        let offset = u32::from(index) * u32::from(self.erase_block_size);
        PageWrite {
            erase_address: self.erase_start + offset,
            write_address: self.write_base + offset,
            write_bytes: self.page_write_bytes,
            offset: offset as usize,
            packets: self.packets_per_page,
        }
    }
}
