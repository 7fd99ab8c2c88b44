//! Mock Link Implementation
//!
//! Simulated serial links for testing without physical hardware. Each connection
//! is a `tokio::io::duplex` pair: the transport gets one half, the test (or bench
//! simulator) plays the device on the other.
//!
//! ```rust,ignore
//! let opener = Arc::new(MockLinkOpener::new("mock-ls336"));
//! let mut device = opener.connect_device();
//! let transport = FramedTransport::spawn(opener.clone(), framing, timing, on_frame)?;
//! device.write_all(b"+4.200\r\n").await?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::DuplexStream;

use super::link::{Link, LinkOpener};
use crate::error::{AppResult, DaqError};

const DUPLEX_CAPACITY: usize = 64 * 1024;

impl Link for DuplexStream {}

/// Hands out pre-armed duplex links.
///
/// Every call to [`MockLinkOpener::connect_device`] arms one future `open()`;
/// opening with nothing armed fails like an unplugged adapter.
pub struct MockLinkOpener {
    name: String,
    armed: Mutex<VecDeque<DuplexStream>>,
    opens: AtomicUsize,
}

impl MockLinkOpener {
    /// Opener with nothing armed.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            armed: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
        }
    }

    /// Arm one connection and return the device end.
    pub fn connect_device(&self) -> DuplexStream {
        let (host, device) = tokio::io::duplex(DUPLEX_CAPACITY);
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(host);
        device
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkOpener for MockLinkOpener {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn open(&self) -> AppResult<Box<dyn Link>> {
        let host = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or(DaqError::SerialPortNotConnected)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(host))
    }
}
