//! Hardware communication layer.
//!
//! - `link`: raw byte streams (serial ports) and how to open them
//! - `framing`: start/end marker and fixed-size packet framing
//! - `transport`: the self-reconnecting framed transport with ask correlation
//! - `gpib`: Prologix-style GPIB bus multiplexed over one transport
//! - `mock`: duplex-backed links for tests and bench runs
//!
//! Protocol code talks to devices through [`FrameChannel`], so the same dialect works
//! over a direct serial transport or a device address on a shared bus.

pub mod framing;
pub mod gpib;
pub mod link;
pub mod mock;
pub mod transport;

pub use framing::{Frame, FramingConfig};
pub use gpib::{GpibAddress, GpibBus, GpibDevice};
pub use link::{Link, LinkOpener, SerialLinkOpener, SerialParity, SerialPortConfig};
pub use mock::MockLinkOpener;
pub use transport::{FramedTransport, ResponseHandler, TransportTiming};

/// Minimal send/answer capability a protocol needs from the layer below.
pub trait FrameChannel: Send + Sync {
    /// Queue a frame. With a handler, the frame is an ask.
    fn send_frame(&self, payload: &[u8], handler: Option<ResponseHandler>);

    /// True while the underlying link is open.
    fn is_connected(&self) -> bool;

    /// Name used in logs.
    fn describe(&self) -> String;

    /// Re-establish any link-level setup after a reconnect.
    fn prepare(&self) {}
}

impl FrameChannel for FramedTransport {
    fn send_frame(&self, payload: &[u8], handler: Option<ResponseHandler>) {
        self.send(payload.to_vec(), handler);
    }

    fn is_connected(&self) -> bool {
        FramedTransport::is_connected(self)
    }

    fn describe(&self) -> String {
        self.name().to_string()
    }
}
