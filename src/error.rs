use std::result::Result as StdResult;

use crate::fsm::{Event, State};
use crate::region::RegionOverflow;
use crate::transport::TransportError;

/// Errors which can occur while preparing an image or talking to the bootloader.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading the hex file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A hex file line could not be decoded.
    #[error("malformed hex record on line {line}: {reason}")]
    MalformedLine { line: usize, reason: &'static str },

    /// The record checksum did not match (only reported with checksum verification enabled).
    #[error("checksum mismatch on line {line}: expected 0x{expected:02x}, found 0x{found:02x}")]
    ChecksumMismatch { line: usize, expected: u8, found: u8 },

    /// A data record did not fit into the region it was surveyed into.
    #[error("{0}")]
    RegionOverflow(RegionOverflow),

    /// The image is scattered over more regions than the builder accepts.
    #[error("image needs more than {0} memory regions")]
    TooManyRegions(usize),

    /// There is nothing to write to program flash.
    #[error("hex file contains no program flash data")]
    EmptyImage,

    /// The bootloader's capability block is shorter than its fixed layout.
    #[error("truncated response: expected {expected} bytes, got {actual}")]
    TruncatedResponse { expected: usize, actual: usize },

    /// A round trip with the device failed. Carries the protocol state and region the engine was
    /// in, which is what a field report needs.
    #[error("transport failure in state {state:?} (region {region}): {source}")]
    Transport {
        state: State,
        region: usize,
        #[source]
        source: TransportError,
    },

    /// The state machine was fed an event its transition table has no entry for.
    #[error("no transition from {state:?} on {event:?}")]
    InvalidTransition { state: State, event: Event },

    /// A region was about to be prepared before the bootloader's capabilities were read.
    #[error("bootloader info has not been read")]
    NoBootInfo,

    /// Data was about to be sent without a prepared region.
    #[error("no region has been prepared")]
    NoRegion,

    /// The bootloader reported an erase or write block size of zero.
    #[error("bootloader reported an invalid flash geometry")]
    InvalidGeometry,

    /// A write does not fit into the 16 bit size field of a write command.
    #[error("write of {0} bytes exceeds the bootloader's size field")]
    PlanTooLarge(u32),

    /// No bootloader device with the requested VID/PID is connected.
    #[error("bootloader device not found")]
    TargetNotFound,

    /// An error occurred while setting up the raw USB connection.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Shorthand for a Result with the crate's own Error type.
pub type Result<T> = StdResult<T, Error>;
