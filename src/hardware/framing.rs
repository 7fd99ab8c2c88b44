//! Byte-level packet framing.
//!
//! A frame on the wire is `[start marker] payload [end marker]`. The start marker is
//! optional; a frame is complete when the accumulated bytes end with the end marker
//! or reach a fixed size. [`FrameDecoder`] classifies incoming bytes one at a time so
//! the receive path can stop at any byte boundary.

use crate::error::{AppResult, DaqError};

/// How completed frames are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameEncoding {
    /// UTF-8 text; frames that do not decode are dropped.
    #[default]
    Utf8,
    /// Raw bytes.
    Raw,
}

/// Framing rules for one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingConfig {
    /// Marker terminating a frame.
    pub end: Option<Vec<u8>>,
    /// Marker opening a frame; bytes before it are discarded.
    pub start: Option<Vec<u8>>,
    /// Frame length that terminates a frame regardless of markers.
    pub fixed_size: Option<usize>,
    /// Delivery encoding.
    pub encoding: FrameEncoding,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            end: Some(b"\n".to_vec()),
            start: None,
            fixed_size: None,
            encoding: FrameEncoding::Utf8,
        }
    }
}

impl FramingConfig {
    /// Text framing terminated by `end`.
    pub fn text(end: &str) -> Self {
        Self {
            end: non_empty(end.as_bytes()),
            ..Self::default()
        }
    }

    /// Set the start marker. An empty marker disables it.
    pub fn with_start(mut self, start: &[u8]) -> Self {
        self.start = non_empty(start);
        self
    }

    /// Set the end marker. An empty marker disables it.
    pub fn with_end(mut self, end: &[u8]) -> Self {
        self.end = non_empty(end);
        self
    }

    /// Terminate frames after `size` bytes.
    pub fn with_fixed_size(mut self, size: usize) -> Self {
        self.fixed_size = Some(size);
        self
    }

    /// Deliver frames as raw bytes.
    pub fn raw(mut self) -> Self {
        self.encoding = FrameEncoding::Raw;
        self
    }

    /// A frame must be terminated by something.
    pub fn validate(&self) -> AppResult<()> {
        if self.end.is_none() && self.fixed_size.is_none() {
            return Err(DaqError::Configuration(
                "Framing needs an end marker or a fixed frame size".into(),
            ));
        }
        if self.fixed_size == Some(0) {
            return Err(DaqError::Configuration("Fixed frame size must be positive".into()));
        }
        Ok(())
    }

    /// Wire bytes for one payload.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let start = self.start.as_deref().unwrap_or_default();
        let end = self.end.as_deref().unwrap_or_default();
        let mut out = Vec::with_capacity(start.len() + payload.len() + end.len());
        out.extend_from_slice(start);
        out.extend_from_slice(payload);
        out.extend_from_slice(end);
        out
    }
}

fn non_empty(marker: &[u8]) -> Option<Vec<u8>> {
    (!marker.is_empty()).then(|| marker.to_vec())
}

/// Advance the start-marker match by one byte. Returns true once it is complete.
fn advance_start(pos: &mut usize, marker: &[u8], byte: u8) -> bool {
    if byte == marker[*pos] {
        *pos += 1;
    } else {
        *pos = usize::from(byte == marker[0]);
    }
    if *pos == marker.len() {
        *pos = 0;
        return true;
    }
    false
}

/// A received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Frame decoded as text.
    Text(String),
    /// Frame delivered as raw bytes.
    Binary(Vec<u8>),
}

impl Frame {
    /// Text content, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(s) => Some(s),
            Frame::Binary(_) => None,
        }
    }

    /// Payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(s) => s.as_bytes(),
            Frame::Binary(b) => b,
        }
    }
}

/// Outcome of feeding one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Nothing complete yet.
    Pending,
    /// A frame completed.
    Frame(Frame),
    /// A frame completed but was not valid in the configured encoding.
    Undecodable(Vec<u8>),
    /// A start marker appeared mid-frame; the partial frame was discarded and a new
    /// frame begins.
    Restarted(Vec<u8>),
}

/// Incremental frame parser.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    config: FramingConfig,
    buf: Vec<u8>,
    started: bool,
    start_pos: usize,
}

impl FrameDecoder {
    /// Decoder for the given rules.
    pub fn new(config: FramingConfig) -> Self {
        Self {
            config,
            buf: Vec::new(),
            started: false,
            start_pos: 0,
        }
    }

    /// Active framing rules.
    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    /// Replace the framing rules, discarding any partial frame.
    pub fn set_config(&mut self, config: FramingConfig) {
        self.config = config;
        self.reset();
    }

    /// Drop any partial frame and wait for a new start marker.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.started = false;
        self.start_pos = 0;
    }

    /// True when no payload bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of payload bytes buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Classify one byte.
    pub fn push(&mut self, byte: u8) -> Decoded {
        let start = self.config.start.as_deref();
        if !self.started {
            match start {
                None => self.started = true,
                Some(marker) => {
                    self.started = advance_start(&mut self.start_pos, marker, byte);
                    return Decoded::Pending;
                }
            }
        }

        self.buf.push(byte);
        let end_hit = self
            .config
            .end
            .as_deref()
            .is_some_and(|end| self.buf.ends_with(end));
        let size_hit = self
            .config
            .fixed_size
            .is_some_and(|size| self.buf.len() >= size);

        if end_hit || size_hit {
            let mut payload = std::mem::take(&mut self.buf);
            if end_hit {
                let end_len = self.config.end.as_ref().map_or(0, Vec::len);
                payload.truncate(payload.len() - end_len);
            }
            self.reset();
            return self.decode(payload);
        }

        if let Some(marker) = start {
            if self.buf.ends_with(marker) {
                let mut discarded = std::mem::take(&mut self.buf);
                discarded.truncate(discarded.len() - marker.len());
                self.reset();
                self.started = true;
                return Decoded::Restarted(discarded);
            }
        }
        Decoded::Pending
    }

    fn decode(&self, payload: Vec<u8>) -> Decoded {
        match self.config.encoding {
            FrameEncoding::Raw => Decoded::Frame(Frame::Binary(payload)),
            FrameEncoding::Utf8 => match String::from_utf8(payload) {
                Ok(text) => Decoded::Frame(Frame::Text(text)),
                Err(e) => Decoded::Undecodable(e.into_bytes()),
            },
        }
    }
}
