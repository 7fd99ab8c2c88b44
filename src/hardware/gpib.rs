//! GPIB devices behind a Prologix-style USB controller.
//!
//! The controller is one serial transport; each device is selected by sending
//! `++addr N` before its frame. Selection and payload are queued as one batch so
//! frames for different devices never interleave between the two.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::transport::{FramedTransport, ResponseHandler};
use super::FrameChannel;
use crate::error::{AppResult, DaqError};

/// Highest primary address on a GPIB bus.
pub const MAX_ADDRESS: u8 = 30;

/// Validated GPIB primary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpibAddress(u8);

impl GpibAddress {
    /// Validate an address.
    pub fn new(address: u8) -> AppResult<Self> {
        if address > MAX_ADDRESS {
            return Err(DaqError::Configuration(format!(
                "GPIB address {} is outside 0..={}",
                address, MAX_ADDRESS
            )));
        }
        Ok(Self(address))
    }

    /// Raw address.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for GpibAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A controller shared by every device on the bus.
#[derive(Clone)]
pub struct GpibBus {
    transport: Arc<FramedTransport>,
}

impl GpibBus {
    /// Wrap the controller's transport.
    pub fn new(transport: Arc<FramedTransport>) -> Self {
        Self { transport }
    }

    /// Put the controller in controller mode with read-after-write.
    pub fn configure_controller(&self) {
        debug!(port = %self.transport.name(), "Configuring GPIB controller");
        self.transport.send_batch(vec![
            (b"++mode 1".to_vec(), None),
            (b"++auto 1".to_vec(), None),
        ]);
    }

    /// Handle for one device.
    pub fn device(&self, address: GpibAddress) -> GpibDevice {
        GpibDevice {
            bus: self.clone(),
            address,
        }
    }

    /// Send a frame to `address`.
    pub fn addr_send(
        &self,
        address: GpibAddress,
        payload: &[u8],
        handler: Option<ResponseHandler>,
    ) {
        self.transport.send_batch(vec![
            (format!("++addr {}", address).into_bytes(), None),
            (payload.to_vec(), handler),
        ]);
    }

    /// Read the status byte of `address`.
    pub fn serial_poll(&self, address: GpibAddress, handler: ResponseHandler) {
        self.transport
            .send(format!("++spoll {}", address).into_bytes(), Some(handler));
    }

    /// Controller transport.
    pub fn transport(&self) -> &Arc<FramedTransport> {
        &self.transport
    }
}

/// One device on a [`GpibBus`].
#[derive(Clone)]
pub struct GpibDevice {
    bus: GpibBus,
    address: GpibAddress,
}

impl GpibDevice {
    /// Device address.
    pub fn address(&self) -> GpibAddress {
        self.address
    }

    /// Read the device status byte.
    pub fn serial_poll(&self, handler: ResponseHandler) {
        self.bus.serial_poll(self.address, handler);
    }
}

impl FrameChannel for GpibDevice {
    fn send_frame(&self, payload: &[u8], handler: Option<ResponseHandler>) {
        self.bus.addr_send(self.address, payload, handler);
    }

    fn is_connected(&self) -> bool {
        self.bus.transport.is_connected()
    }

    fn describe(&self) -> String {
        format!("{} (GPIB {})", self.bus.transport.name(), self.address)
    }

    fn prepare(&self) {
        self.bus.configure_controller();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_range() {
        assert_eq!(GpibAddress::new(12).expect("valid").get(), 12);
        assert!(GpibAddress::new(31).is_err());
    }
}
