//! Streaming reader for Intel HEX files.
//!
//! Only the record types a PIC32 image needs are interpreted; everything else is handed back as
//! [`RecordType::Other`] so the caller can skip it.

use std::io::BufRead;

use crate::error::{Error, Result};

/// Whether record checksums are verified while reading.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ChecksumPolicy {
    /// Accept records regardless of their checksum byte.
    #[default]
    Ignore,

    /// Reject records whose checksum does not match.
    Verify,
}

/// Intel HEX record types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    ExtendedLinearAddress,
    /// Start address records and anything else without meaning for flashing.
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(code: u8) -> RecordType {
        match code {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x02 => RecordType::ExtendedSegmentAddress,
            0x04 => RecordType::ExtendedLinearAddress,
            other => RecordType::Other(other),
        }
    }
}

/// A single decoded line of a hex file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HexRecord {
    pub record_type: RecordType,

    /// 16 bit load offset, relative to the current [`AddressContext`].
    pub load_address: u16,

    pub data: Vec<u8>,
}

/// Upper address bits set by extended address records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AddressContext {
    root_address: u32,
}

impl AddressContext {
    /// Feeds a record into the context. Returns the absolute address for data records and `None`
    /// for everything else.
    ///
    /// ```rust
    /// use mikroflash::{AddressContext, HexRecord, RecordType};
    ///
    /// let mut context = AddressContext::default();
    /// context.apply(&HexRecord {
    ///     record_type: RecordType::ExtendedLinearAddress,
    ///     load_address: 0,
    ///     data: vec![0x1d, 0x00],
    /// });
    /// let address = context.apply(&HexRecord {
    ///     record_type: RecordType::Data,
    ///     load_address: 0x0600,
    ///     data: vec![0xde, 0xad],
    /// });
    /// assert_eq!(address, Some(0x1d00_0600));
    /// ```
    pub fn apply(&mut self, record: &HexRecord) -> Option<u32> {
        match record.record_type {
            RecordType::Data => Some(self.root_address.wrapping_add(record.load_address.into())),
            RecordType::ExtendedSegmentAddress => {
                self.root_address = u32::from(record.upper_word()) << 4;
                None
            }
            RecordType::ExtendedLinearAddress => {
                self.root_address = u32::from(record.upper_word()) << 16;
                None
            }
            _ => None,
        }
    }

    pub fn root_address(&self) -> u32 {
        self.root_address
    }
}

impl HexRecord {
    /// Big-endian 16 bit payload of an address record. Missing bytes read as zero.
    fn upper_word(&self) -> u16 {
        let hi = self.data.first().copied().unwrap_or(0);
        let lo = self.data.get(1).copied().unwrap_or(0);
        u16::from_be_bytes([hi, lo])
    }
}

/// Reads [`HexRecord`]s line by line from a text stream.
pub struct HexRecordReader<R> {
    reader: R,
    policy: ChecksumPolicy,
    line: Vec<u8>,
    line_number: usize,
}

impl<R: BufRead> HexRecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_policy(reader, ChecksumPolicy::default())
    }

    pub fn with_policy(reader: R, policy: ChecksumPolicy) -> Self {
        Self {
            reader,
            policy,
            line: Vec::new(),
            line_number: 0,
        }
    }

    /// Number of the line the last record was read from (1-based).
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Returns the next record, or `None` once the stream is exhausted. Blank lines are skipped.
    pub fn next_record(&mut self) -> Result<Option<HexRecord>> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let end = self
                .line
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map_or(0, |i| i + 1);
            let text = &self.line[..end];
            if text.is_empty() {
                continue;
            }

            return decode_line(text, self.line_number, self.policy).map(Some);
        }
    }

    /// Gives back the underlying reader, e.g. to rewind it for a second pass.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: BufRead> Iterator for HexRecordReader<R> {
    type Item = Result<HexRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn decode_line(text: &[u8], line: usize, policy: ChecksumPolicy) -> Result<HexRecord> {
    let malformed = |reason| Error::MalformedLine { line, reason };

    let digits = text.strip_prefix(b":").unwrap_or(text);
    if digits.len() % 2 != 0 {
        return Err(malformed("odd number of hex digits"));
    }

    let bytes = digits
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(malformed("invalid hex digit")),
        })
        .collect::<Result<Vec<u8>>>()?;

    // [count][addr hi][addr lo][type] ... [checksum]
    if bytes.len() < 5 {
        return Err(malformed("record too short"));
    }
    let count = usize::from(bytes[0]);
    if bytes.len() < count + 5 {
        return Err(malformed("payload shorter than byte count"));
    }

    if policy == ChecksumPolicy::Verify {
        let sum = bytes[..count + 4]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        let expected = sum.wrapping_neg();
        let found = bytes[count + 4];
        if expected != found {
            return Err(Error::ChecksumMismatch {
                line,
                expected,
                found,
            });
        }
    }

    Ok(HexRecord {
        record_type: bytes[3].into(),
        load_address: u16::from_be_bytes([bytes[1], bytes[2]]),
        data: bytes[4..4 + count].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(text: &str) -> HexRecordReader<Cursor<&[u8]>> {
        HexRecordReader::new(Cursor::new(text.as_bytes()))
    }

    #[test]
    fn decodes_data_record() {
        let mut reader = reader(":04060000DEADBEEFBE\n");
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.record_type, RecordType::Data);
        assert_eq!(record.load_address, 0x0600);
        assert_eq!(record.data, vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn skips_blank_lines_and_carriage_returns() {
        let records = reader("\r\n:020000041D00DD\r\n\n:00000001FF\r\n")
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, RecordType::ExtendedLinearAddress);
        assert_eq!(records[1].record_type, RecordType::EndOfFile);
    }

    #[test]
    fn rejects_non_hex_characters() {
        let mut reader = reader(":0400000G01020304F2\n");
        match reader.next_record() {
            Err(Error::MalformedLine { line: 1, .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn non_ascii_bytes_are_malformed_lines() {
        let text: &[u8] = b":020000041D00DD\n:04000000\xff\xfe0304F2\n:00000001FF\n";
        let mut reader = HexRecordReader::new(Cursor::new(text));
        assert!(reader.next_record().unwrap().is_some());
        match reader.next_record() {
            Err(Error::MalformedLine { line: 2, .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut reader = reader(":10000000DEADBEEF\n");
        assert!(matches!(
            reader.next_record(),
            Err(Error::MalformedLine { .. })
        ));
    }

    #[test]
    fn checksum_is_ignored_by_default() {
        let mut reader = reader(":0400000001020304FF\n");
        assert!(reader.next_record().unwrap().is_some());
    }

    #[test]
    fn checksum_verification_is_opt_in() {
        let text = ":0400000001020304F2\n:0400000001020304FF\n";
        let mut reader =
            HexRecordReader::with_policy(Cursor::new(text.as_bytes()), ChecksumPolicy::Verify);
        assert!(reader.next_record().unwrap().is_some());
        match reader.next_record() {
            Err(Error::ChecksumMismatch {
                line: 2,
                expected: 0xf2,
                found: 0xff,
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn segment_and_linear_addresses() {
        let mut context = AddressContext::default();
        let segment = HexRecord {
            record_type: RecordType::ExtendedSegmentAddress,
            load_address: 0,
            data: vec![0x12, 0x34],
        };
        let data = HexRecord {
            record_type: RecordType::Data,
            load_address: 0x0010,
            data: vec![0],
        };
        assert_eq!(context.apply(&segment), None);
        assert_eq!(context.apply(&data), Some(0x12350));

        // The context persists across data records until the next address record
        assert_eq!(context.apply(&data), Some(0x12350));

        let linear = HexRecord {
            record_type: RecordType::ExtendedLinearAddress,
            load_address: 0,
            data: vec![0x1f, 0xc0],
        };
        context.apply(&linear);
        assert_eq!(context.apply(&data), Some(0x1fc0_0010));
    }
}
