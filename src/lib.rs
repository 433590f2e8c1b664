//! This crate flashes Intel HEX images into PIC32 microcontrollers running the mikroBootloader,
//! which is reached as a USB HID device exchanging 64 byte reports.
//!
//! Flashing happens in two parts. A [`RegionBuilder`] turns the hex file into a [`MemoryImage`]
//! of erased-filled regions, and a [`ProtocolEngine`] walks the bootloader through erasing and
//! writing program flash, an optional boot vector page and configuration flash before restarting
//! the device. Configuration flash is rewritten so that the device re-enters the bootloader on
//! every reset, which keeps it reflashable.
//!
//! # Example: Basic flashing
//! ```rust, no_run
//! use mikroflash::{Context, ProtocolEngine, RegionBuilder, TargetConfig};
//! use mikroflash::{PRODUCT_ID, VENDOR_ID};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TargetConfig::default();
//!
//! // Build the memory image before touching the device
//! let image = RegionBuilder::new(&config).build_file("firmware.hex")?;
//!
//! // Find the bootloader and take over its HID interface
//! let context = Context::new()?;
//! let transport = context.open(VENDOR_ID, PRODUCT_ID)?;
//!
//! // Run the whole sequence, reporting progress along the way
//! let mut engine = ProtocolEngine::with_image(transport, &config, image)?;
//! for progress in &mut engine {
//!     let progress = progress?;
//!     println!("{} bytes written", progress.written);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Progress feedback is provided through the [`Operation`] trait; [`Operation::execute`] runs the
//! engine to completion without it.

mod bootloader_info;
mod builder;
mod context;
mod engine;
mod error;
mod flash;
pub mod fsm;
mod hex;
mod operation;
mod packet;
mod planner;
mod region;
mod transport;

pub use bootloader_info::{BootInfo, McuKind, BOOT_INFO_LEN};
pub use builder::RegionBuilder;
pub use context::{Context, INTERFACE, PRODUCT_ID, VENDOR_ID};
pub use engine::{
    read_boot_info, ProtocolEngine, ProtocolSession, BOOT_VECTOR_REGION, CONFIG_REGION,
    PROGRAM_REGION,
};
pub use error::{Error, Result};
pub use flash::{
    jump_stub, kseg1, BootVectorPolicy, TargetConfig, CONFIG_FLASH_BASE, NOP, PROGRAM_FLASH_BASE,
    RECOVERY_VECTOR, STUB_LEN,
};
pub use fsm::State;
pub use hex::{AddressContext, ChecksumPolicy, HexRecord, HexRecordReader, RecordType};
pub use operation::{Operation, Progress};
pub use packet::{Command, Opcode, Packet, STX};
pub use planner::{FlashPlan, FlashPlanner, PageWrite};
pub use region::{MemoryImage, MemoryRegion, RegionKind, RegionOverflow, ERASED};
pub use rusb::UsbContext;
pub use transport::{
    HidTransport, TransferMode, Transport, TransportError, IN_ENDPOINT, OUT_ENDPOINT,
};

/// Size of every report exchanged with the bootloader.
pub const PACKET_SIZE: usize = 64;

/// Timeout for all usb transactions.
const TIMEOUT: std::time::Duration = std::time::Duration::from_millis(5000);
