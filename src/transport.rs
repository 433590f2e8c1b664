//! Moving reports between host and bootloader.

use std::time::Duration;

use rusb::{DeviceHandle, UsbContext};

use crate::packet::Packet;
use crate::{PACKET_SIZE, TIMEOUT};

/// Interrupt OUT endpoint of the bootloader's HID interface.
pub const OUT_ENDPOINT: u8 = 0x01;

/// Interrupt IN endpoint of the bootloader's HID interface.
pub const IN_ENDPOINT: u8 = 0x81;

/// What to expect from the device after a report has been sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferMode {
    /// Read one report back.
    AwaitResponse,

    /// Only send; the device does not answer this report.
    OutOnly,

    /// Only send; the device resets and may vanish before the transfer completes.
    FinalReboot,
}

/// Errors of a single round trip.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("USB transfer failed: {0}")]
    Usb(#[from] rusb::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("device answered with an empty report")]
    NoData,
}

impl TransportError {
    /// Whether the error looks like the device dropping off the bus, as it does when it reboots.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::Usb(
                rusb::Error::NoDevice
                    | rusb::Error::Timeout
                    | rusb::Error::Pipe
                    | rusb::Error::Io
                    | rusb::Error::NotFound
            )
        )
    }
}

/// A channel which carries one report to the device and optionally one back.
pub trait Transport {
    /// Sends `report`. Returns the device's answer for [`TransferMode::AwaitResponse`] and `None`
    /// otherwise.
    fn send_receive(
        &mut self,
        report: &Packet,
        mode: TransferMode,
    ) -> Result<Option<[u8; PACKET_SIZE]>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_receive(
        &mut self,
        report: &Packet,
        mode: TransferMode,
    ) -> Result<Option<[u8; PACKET_SIZE]>, TransportError> {
        (**self).send_receive(report, mode)
    }
}

/// Interrupt transfers on a claimed HID interface.
pub struct HidTransport<T: UsbContext> {
    handle: DeviceHandle<T>,
    interface: u8,
    timeout: Duration,
}

impl<T: UsbContext> HidTransport<T> {
    /// Wraps a handle whose `interface` has already been claimed. The interface is released when
    /// the transport is dropped.
    pub fn new(handle: DeviceHandle<T>, interface: u8) -> Self {
        Self {
            handle,
            interface,
            timeout: TIMEOUT,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl<T: UsbContext> Transport for HidTransport<T> {
    fn send_receive(
        &mut self,
        report: &Packet,
        mode: TransferMode,
    ) -> Result<Option<[u8; PACKET_SIZE]>, TransportError> {
        log::trace!("OUT {:?}", report);
        let written = self
            .handle
            .write_interrupt(OUT_ENDPOINT, report.as_bytes(), self.timeout)?;
        if written != PACKET_SIZE {
            return Err(TransportError::ShortWrite {
                written,
                expected: PACKET_SIZE,
            });
        }

        if mode != TransferMode::AwaitResponse {
            return Ok(None);
        }

        let mut response = [0u8; PACKET_SIZE];
        let read = self
            .handle
            .read_interrupt(IN_ENDPOINT, &mut response, self.timeout)?;
        if read == 0 {
            return Err(TransportError::NoData);
        }
        log::trace!("IN  {:02x?}", &response[..read]);

        Ok(Some(response))
    }
}

impl<T: UsbContext> Drop for HidTransport<T> {
    fn drop(&mut self) {
        // The device is gone after a reboot, so failing to release is expected
        let _ = self.handle.release_interface(self.interface);
    }
}
