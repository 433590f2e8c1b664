//! Physical memory regions and the image assembled from them.

use std::fmt;

/// Value of erased flash. Gaps in an image are filled with it.
pub const ERASED: u8 = 0xff;

/// Kind of flash a region lives in.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RegionKind {
    /// Application flash, `[program_flash_base, config_flash_base)`.
    ProgramFlash,

    /// The page holding the boot vector stub near the end of program flash.
    BootVectorPage,

    /// Boot/configuration flash, everything from `config_flash_base` upwards.
    ConfigFlash,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegionKind::ProgramFlash => "program flash",
            RegionKind::BootVectorPage => "boot vector page",
            RegionKind::ConfigFlash => "config flash",
        })
    }
}

/// A contiguous span of target memory together with the bytes to be written there.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    kind: RegionKind,
    start: u32,
    buffer: Vec<u8>,
}

impl MemoryRegion {
    /// Creates a region covering `start..=end`, filled with [`ERASED`].
    ///
    /// ```rust
    /// use mikroflash::{MemoryRegion, RegionKind};
    ///
    /// let region = MemoryRegion::erased(RegionKind::ProgramFlash, 0x1d00_0000, 0x1d00_000f);
    /// assert_eq!(region.len(), 16);
    /// assert!(region.data().iter().all(|b| *b == 0xff));
    /// ```
    pub fn erased(kind: RegionKind, start: u32, end: u32) -> Self {
        let len = end.saturating_sub(start) as usize + 1;
        Self::from_bytes(kind, start, vec![ERASED; len])
    }

    pub fn from_bytes(kind: RegionKind, start: u32, buffer: Vec<u8>) -> Self {
        Self {
            kind,
            start,
            buffer,
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Physical address of the first byte.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Physical address of the last byte (inclusive).
    pub fn end(&self) -> u32 {
        self.start + (self.buffer.len() as u32).saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn contains(&self, address: u32) -> bool {
        !self.buffer.is_empty() && address >= self.start && address <= self.end()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Copies `data` to `address`. Bytes which would land past the end of the region are dropped
    /// and reported in the returned overflow.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Option<RegionOverflow> {
        if !self.contains(address) {
            return Some(RegionOverflow {
                address,
                length: data.len(),
                dropped: data.len(),
                region_end: None,
            });
        }

        let offset = (address - self.start) as usize;
        let room = self.buffer.len() - offset;
        let fitting = data.len().min(room);
        self.buffer[offset..offset + fitting].copy_from_slice(&data[..fitting]);

        if fitting < data.len() {
            Some(RegionOverflow {
                address,
                length: data.len(),
                dropped: data.len() - fitting,
                region_end: Some(self.end()),
            })
        } else {
            None
        }
    }

    /// Grows or shrinks the region to `len` bytes, padding with [`ERASED`].
    pub fn resize(&mut self, len: usize) {
        self.buffer.resize(len, ERASED);
    }
}

/// A data record which did not fit into the region table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionOverflow {
    /// Absolute address of the record.
    pub address: u32,

    /// Payload length of the record.
    pub length: usize,

    /// Number of bytes which were not written.
    pub dropped: usize,

    /// Last address of the region the record started in, `None` if it started outside any region.
    pub region_end: Option<u32>,
}

impl fmt::Display for RegionOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region_end {
            Some(end) => write!(
                f,
                "record at 0x{:08x} ({} bytes) overruns region ending at 0x{:08x}, {} bytes dropped",
                self.address, self.length, end, self.dropped
            ),
            None => write!(
                f,
                "record at 0x{:08x} ({} bytes) lies outside every region, dropped",
                self.address, self.length
            ),
        }
    }
}

/// The complete set of regions built from one hex file.
#[derive(Clone, Debug, Default)]
pub struct MemoryImage {
    regions: Vec<MemoryRegion>,
    data_size: usize,
    overflows: Vec<RegionOverflow>,
}

impl MemoryImage {
    pub(crate) fn new(regions: Vec<MemoryRegion>) -> Self {
        Self {
            regions,
            data_size: 0,
            overflows: Vec::new(),
        }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn regions_of(&self, kind: RegionKind) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(move |r| r.kind == kind)
    }

    /// Lowest address covered by any region.
    pub fn min_address(&self) -> Option<u32> {
        self.regions.iter().map(MemoryRegion::start).min()
    }

    /// Highest address covered by any region (inclusive).
    pub fn max_address(&self) -> Option<u32> {
        self.regions.iter().map(MemoryRegion::end).max()
    }

    /// Number of bytes explicitly present in data records that were loaded.
    pub fn total_data_size(&self) -> usize {
        self.data_size
    }

    /// Records which could not be loaded completely.
    pub fn overflows(&self) -> &[RegionOverflow] {
        &self.overflows
    }

    pub(crate) fn region_for_mut(&mut self, address: u32) -> Option<&mut MemoryRegion> {
        self.regions.iter_mut().find(|r| r.contains(address))
    }

    pub(crate) fn record_loaded(&mut self, bytes: usize) {
        self.data_size += bytes;
    }

    pub(crate) fn record_overflow(&mut self, overflow: RegionOverflow) {
        self.overflows.push(overflow);
    }

    /// Merges all regions of `kind` into a single region starting at `base`. Bytes between the
    /// regions are [`ERASED`]. Returns `None` if the image has no region of that kind.
    pub fn flatten(&self, kind: RegionKind, base: u32) -> Option<MemoryRegion> {
        let end = self
            .regions_of(kind)
            .filter(|r| r.end() >= base)
            .map(MemoryRegion::end)
            .max()?;

        let mut flat = MemoryRegion::erased(kind, base, end);
        for region in self.regions_of(kind) {
            if region.end() < base {
                continue;
            }
            let skip = base.saturating_sub(region.start()) as usize;
            flat.write(region.start().max(base), &region.data()[skip..]);
        }
        Some(flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_within_bounds() {
        let mut region = MemoryRegion::erased(RegionKind::ProgramFlash, 0x100, 0x10f);
        assert_eq!(region.write(0x104, &[1, 2, 3]), None);
        assert_eq!(&region.data()[..8], &[0xff, 0xff, 0xff, 0xff, 1, 2, 3, 0xff]);
    }

    #[test]
    fn write_past_end_is_truncated() {
        let mut region = MemoryRegion::erased(RegionKind::ProgramFlash, 0x100, 0x103);
        let overflow = region.write(0x102, &[1, 2, 3, 4]).unwrap();
        assert_eq!(overflow.dropped, 2);
        assert_eq!(overflow.region_end, Some(0x103));
        assert_eq!(region.data(), &[0xff, 0xff, 1, 2]);
    }

    #[test]
    fn write_outside_is_dropped() {
        let mut region = MemoryRegion::erased(RegionKind::ProgramFlash, 0x100, 0x103);
        let overflow = region.write(0x200, &[1, 2]).unwrap();
        assert_eq!(overflow.dropped, 2);
        assert_eq!(overflow.region_end, None);
        assert!(region.data().iter().all(|b| *b == ERASED));
    }

    #[test]
    fn flatten_anchors_at_base_and_fills_gaps() {
        let mut image = MemoryImage::new(vec![
            MemoryRegion::from_bytes(RegionKind::ProgramFlash, 0x1004, vec![1, 2]),
            MemoryRegion::from_bytes(RegionKind::ProgramFlash, 0x1010, vec![3]),
            MemoryRegion::from_bytes(RegionKind::ConfigFlash, 0x2000, vec![9]),
        ]);
        image.record_loaded(3);

        let flat = image.flatten(RegionKind::ProgramFlash, 0x1000).unwrap();
        assert_eq!(flat.start(), 0x1000);
        assert_eq!(flat.end(), 0x1010);
        assert_eq!(&flat.data()[4..6], &[1, 2]);
        assert_eq!(flat.data()[0x10], 3);
        assert_eq!(flat.data().iter().filter(|b| **b != ERASED).count(), 3);

        assert!(image.flatten(RegionKind::BootVectorPage, 0x1000).is_none());
        assert_eq!(image.min_address(), Some(0x1004));
        assert_eq!(image.max_address(), Some(0x2000));
    }
}
