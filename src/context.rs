use rusb::UsbContext;

use crate::error::{Error, Result};
use crate::transport::HidTransport;

/// Default USB vendor ID of the mikroBootloader HID device.
pub const VENDOR_ID: u16 = 0x2dbc;

/// Default USB product ID of the mikroBootloader HID device.
pub const PRODUCT_ID: u16 = 0x0001;

/// Interface number of the bootloader's HID interface.
pub const INTERFACE: u8 = 0;

pub struct Context {
    pub usb_context: rusb::Context,
}

impl Context {
    pub fn new() -> Result<Self> {
        let usb_context = rusb::Context::new()?;
        Ok(Context { usb_context })
    }

    /// Opens the first device matching `vendor_id` and `product_id`, takes it over from the kernel's
    /// HID driver and claims its interface.
    pub fn open(&self, vendor_id: u16, product_id: u16) -> Result<HidTransport<rusb::Context>> {
        let handle = self
            .usb_context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(Error::TargetNotFound)?;
        log::info!("Opened device {:04x}:{:04x}", vendor_id, product_id);

        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(error) => return Err(error.into()),
        }
        handle.claim_interface(INTERFACE)?;

        Ok(HidTransport::new(handle, INTERFACE))
    }
}
