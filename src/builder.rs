//! Builds a [`MemoryImage`] from a hex file in two passes: a survey pass which sizes the regions
//! and a load pass which copies the record payloads into them.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek};
use std::path::Path;

use crate::error::{Error, Result};
use crate::flash::TargetConfig;
use crate::hex::{AddressContext, HexRecord, HexRecordReader, RecordType};
use crate::region::{MemoryImage, MemoryRegion, RegionKind, RegionOverflow};

/// Inclusive address span of a region during the survey pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Extent {
    kind: RegionKind,
    start: u32,
    end: u32,
}

impl Extent {
    /// Whether `start..=end` overlaps this extent or leaves at most `gap` bytes between them.
    fn reaches(&self, start: u32, end: u32, gap: u32) -> bool {
        let reach = gap.saturating_add(1);
        start <= self.end.saturating_add(reach) && end.saturating_add(reach) >= self.start
    }
}

pub struct RegionBuilder<'c> {
    config: &'c TargetConfig,
}

impl<'c> RegionBuilder<'c> {
    pub fn new(config: &'c TargetConfig) -> Self {
        Self { config }
    }

    /// Opens a hex file and runs both passes over it.
    pub fn build_file<P: AsRef<Path>>(&self, path: P) -> Result<MemoryImage> {
        let file = File::open(path)?;
        self.build(BufReader::new(file))
    }

    /// Runs the survey pass, rewinds the stream and runs the load pass.
    pub fn build<R: BufRead + Seek>(&self, mut reader: R) -> Result<MemoryImage> {
        let mut image = self.survey(&mut reader)?;
        reader.rewind()?;
        self.load(&mut image, &mut reader)?;
        Ok(image)
    }

    /// Determines the regions needed for all data records, without loading any data. Every
    /// returned region is filled with erased bytes.
    pub fn survey<R: BufRead>(&self, reader: R) -> Result<MemoryImage> {
        let mut extents: Vec<Extent> = Vec::new();
        let mut ignored = 0usize;

        for_each_data_record(reader, self.config, |address, record| {
            let kind = match self.config.classify(address) {
                Some(kind) => kind,
                None => {
                    ignored += 1;
                    return Ok(());
                }
            };
            let end = address.saturating_add(record.data.len() as u32 - 1);

            match extents
                .iter_mut()
                .find(|e| e.kind == kind && e.reaches(address, end, self.config.region_gap))
            {
                Some(extent) => {
                    extent.start = extent.start.min(address);
                    extent.end = extent.end.max(end);
                    coalesce(&mut extents, self.config.region_gap);
                }
                None => {
                    extents.push(Extent {
                        kind,
                        start: address,
                        end,
                    });
                    if extents.len() > self.config.max_regions {
                        return Err(Error::TooManyRegions(self.config.max_regions));
                    }
                }
            }
            Ok(())
        })?;

        if ignored > 0 {
            log::warn!(
                "Ignoring {} data records below program flash (0x{:08x})",
                ignored,
                self.config.program_flash_base
            );
        }

        extents.sort_by_key(|e| (e.kind, e.start));
        for extent in &extents {
            log::debug!(
                "Surveyed {} region 0x{:08x}..=0x{:08x}",
                extent.kind,
                extent.start,
                extent.end
            );
        }

        Ok(MemoryImage::new(
            extents
                .into_iter()
                .map(|e| MemoryRegion::erased(e.kind, e.start, e.end))
                .collect(),
        ))
    }

    /// Copies every data record into the region containing its address. Records which do not fit
    /// are truncated or dropped and recorded on the image.
    pub fn load<R: BufRead>(&self, image: &mut MemoryImage, reader: R) -> Result<()> {
        for_each_data_record(reader, self.config, |address, record| {
            if self.config.classify(address).is_none() {
                return Ok(());
            }

            let overflow = match image.region_for_mut(address) {
                Some(region) => region.write(address, &record.data),
                None => Some(RegionOverflow {
                    address,
                    length: record.data.len(),
                    dropped: record.data.len(),
                    region_end: None,
                }),
            };

            let dropped = overflow.map_or(0, |o| o.dropped);
            image.record_loaded(record.data.len() - dropped);
            if let Some(overflow) = overflow {
                log::warn!("{}", Error::RegionOverflow(overflow));
                image.record_overflow(overflow);
            }
            Ok(())
        })
    }
}

/// Reads records up to the end-of-file record, resolving addresses and calling `f` for every
/// non-empty data record.
fn for_each_data_record<R, F>(reader: R, config: &TargetConfig, mut f: F) -> Result<()>
where
    R: BufRead,
    F: FnMut(u32, &HexRecord) -> Result<()>,
{
    let mut reader = HexRecordReader::with_policy(reader, config.checksum);
    let mut context = AddressContext::default();

    while let Some(record) = reader.next_record()? {
        match record.record_type {
            RecordType::EndOfFile => break,
            RecordType::Other(code) => {
                log::trace!(
                    "Skipping record type 0x{:02x} on line {}",
                    code,
                    reader.line_number()
                );
            }
            _ => {
                if let Some(address) = context.apply(&record) {
                    if !record.data.is_empty() {
                        f(address, &record)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Merges extents of the same kind which lie within `gap` of each other.
fn coalesce(extents: &mut Vec<Extent>, gap: u32) {
    extents.sort_by_key(|e| (e.kind, e.start));
    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents.drain(..) {
        match merged.last_mut() {
            Some(last) if last.kind == extent.kind && last.reaches(extent.start, extent.end, gap) => {
                last.end = last.end.max(extent.end);
            }
            _ => merged.push(extent),
        }
    }
    *extents = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::ERASED;
    use std::io::Cursor;

    /// Formats a record line including a valid checksum.
    fn line(record_type: u8, address: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8, (address >> 8) as u8, address as u8, record_type];
        bytes.extend_from_slice(data);
        let checksum = bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b)).wrapping_neg();
        bytes.push(checksum);
        let digits: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        format!(":{}\n", digits)
    }

    fn linear(upper: u16) -> String {
        line(0x04, 0, &upper.to_be_bytes())
    }

    fn build(text: &str) -> MemoryImage {
        let config = TargetConfig::default();
        RegionBuilder::new(&config)
            .build(Cursor::new(text.as_bytes()))
            .unwrap()
    }

    #[test]
    fn single_record_after_linear_address() {
        let text = linear(0x1d00) + &line(0, 0x0600, &[0xde, 0xad, 0xbe, 0xef]) + &line(1, 0, &[]);
        let image = build(&text);

        assert_eq!(image.regions().len(), 1);
        assert_eq!(image.total_data_size(), 4);
        let flat = image
            .flatten(RegionKind::ProgramFlash, 0x1d00_0000)
            .unwrap();
        assert_eq!(&flat.data()[0x600..0x604], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            flat.data().iter().filter(|b| **b != ERASED).count(),
            4,
            "every other byte stays erased"
        );
    }

    #[test]
    fn records_round_trip_with_gaps_erased() {
        let records: [(u16, &[u8]); 3] = [
            (0x0000, &[1, 2, 3, 4]),
            (0x0010, &[5, 6]),
            (0x0200, &[7, 8, 9]),
        ];
        let mut text = linear(0x1d00);
        for (address, data) in records.iter() {
            text += &line(0, *address, data);
        }
        text += &line(1, 0, &[]);

        let image = build(&text);
        assert_eq!(image.regions().len(), 1);
        let region = &image.regions()[0];
        assert_eq!(region.start(), 0x1d00_0000);
        assert_eq!(region.end(), 0x1d00_0202);

        let mut expected = vec![ERASED; region.len()];
        for (address, data) in records.iter() {
            let offset = *address as usize;
            expected[offset..offset + data.len()].copy_from_slice(data);
        }
        assert_eq!(region.data(), expected.as_slice());
    }

    #[test]
    fn distant_records_and_kinds_split_regions() {
        let text = linear(0x1d00)
            + &line(0, 0x0000, &[1; 16])
            // Exactly 0x400 bytes after the first record
            + &line(0, 0x0410, &[2; 16])
            // Too far away
            + &line(0, 0x1000, &[3; 16])
            + &linear(0x1fc0)
            + &line(0, 0x0000, &[4; 4])
            + &line(1, 0, &[]);

        let image = build(&text);
        let spans: Vec<_> = image
            .regions()
            .iter()
            .map(|r| (r.kind(), r.start(), r.end()))
            .collect();
        assert_eq!(
            spans,
            vec![
                (RegionKind::ProgramFlash, 0x1d00_0000, 0x1d00_041f),
                (RegionKind::ProgramFlash, 0x1d00_1000, 0x1d00_100f),
                (RegionKind::ConfigFlash, 0x1fc0_0000, 0x1fc0_0003),
            ]
        );
    }

    #[test]
    fn bridging_record_coalesces_regions() {
        let text = linear(0x1d00)
            + &line(0, 0x0000, &[1; 4])
            + &line(0, 0x0800, &[2; 4])
            + &line(0, 0x0400, &[3; 4])
            + &line(1, 0, &[]);

        let image = build(&text);
        assert_eq!(image.regions().len(), 1);
        assert_eq!(image.regions()[0].end(), 0x1d00_0803);
    }

    #[test]
    fn stops_at_end_of_file_record() {
        let text = linear(0x1d00) + &line(0, 0, &[1]) + &line(1, 0, &[]) + &line(0, 0x10, &[2]);
        let image = build(&text);
        assert_eq!(image.total_data_size(), 1);
        assert_eq!(image.regions()[0].len(), 1);
    }

    #[test]
    fn segment_addresses_are_resolved() {
        // 0x1d00_0000 is not reachable through a 20 bit segment address, so only check that the
        // record lands below program flash and is ignored.
        let text = line(0x02, 0, &[0x10, 0x00]) + &line(0, 0x0004, &[1, 2]) + &line(1, 0, &[]);
        let image = build(&text);
        assert!(image.regions().is_empty());
        assert_eq!(image.total_data_size(), 0);
    }

    #[test]
    fn too_many_regions() {
        let config = TargetConfig {
            max_regions: 2,
            ..TargetConfig::default()
        };
        let text = linear(0x1d00)
            + &line(0, 0x0000, &[1])
            + &line(0, 0x2000, &[1])
            + &line(0, 0x4000, &[1])
            + &line(1, 0, &[]);
        let result = RegionBuilder::new(&config).survey(Cursor::new(text.as_bytes()));
        assert!(matches!(result, Err(Error::TooManyRegions(2))));
    }

    #[test]
    fn overflowing_record_is_truncated_and_reported() {
        let config = TargetConfig::default();
        let builder = RegionBuilder::new(&config);

        let surveyed = linear(0x1d00) + &line(0, 0x0000, &[0; 8]) + &line(1, 0, &[]);
        let mut image = builder.survey(Cursor::new(surveyed.as_bytes())).unwrap();

        // The file changed between the passes: the record now runs past the region
        let loaded = linear(0x1d00)
            + &line(0, 0x0004, &[0xaa; 8])
            + &line(0, 0x0100, &[0xbb; 2])
            + &line(1, 0, &[]);
        builder
            .load(&mut image, Cursor::new(loaded.as_bytes()))
            .unwrap();

        let region = &image.regions()[0];
        assert_eq!(region.len(), 8);
        assert_eq!(region.data(), &[0xff, 0xff, 0xff, 0xff, 0xaa, 0xaa, 0xaa, 0xaa]);
        assert_eq!(image.total_data_size(), 4);

        let overflows = image.overflows();
        assert_eq!(overflows.len(), 2);
        assert_eq!(overflows[0].dropped, 4);
        assert_eq!(overflows[0].region_end, Some(0x1d00_0007));
        assert_eq!(overflows[1].address, 0x1d00_0100);
        assert_eq!(overflows[1].region_end, None);
    }
}
