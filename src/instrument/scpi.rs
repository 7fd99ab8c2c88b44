//! SCPI request/answer dialect with connectivity inference.
//!
//! Serial SCPI devices give no link-level signal when they are switched off or
//! unplugged behind a converter. [`ScpiSession`] infers it from the timing of asks
//! and answers, keeps polling the identity while a device is silent, and re-sends
//! the initial configuration once it comes back.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::hardware::{Frame, FrameChannel};

/// Timing of connectivity inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpiTiming {
    /// Silence after an ask that marks the device unresponsive.
    #[serde(with = "humantime_serde")]
    pub disconnect_timeout: Duration,
    /// Interval between identity probes while unresponsive.
    #[serde(with = "humantime_serde")]
    pub recheck_interval: Duration,
    /// Settle time between recovery and reconfiguration.
    #[serde(with = "humantime_serde")]
    pub reconfig_pause: Duration,
}

impl Default for ScpiTiming {
    fn default() -> Self {
        Self {
            disconnect_timeout: Duration::from_secs(30),
            recheck_interval: Duration::from_secs(60),
            reconfig_pause: Duration::from_secs(3),
        }
    }
}

/// Connectivity state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Answering; normal polling.
    Responsive,
    /// Silent; only identity probes are sent.
    Unresponsive,
    /// Answering again; waiting to reconfigure.
    ReconfigPending,
}

/// What the instrument should do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Request fresh data.
    RequestData,
    /// Nothing to request this cycle.
    Idle,
}

#[derive(Debug, Default, Clone, Copy)]
struct AskClock {
    first_ask: Option<Instant>,
    last_ask: Option<Instant>,
    last_response: Option<Instant>,
}

/// SCPI session with one device.
pub struct ScpiSession {
    label: String,
    expected_idn: String,
    channel: Arc<dyn FrameChannel>,
    timing: ScpiTiming,
    clock: Arc<Mutex<AskClock>>,
    state: LinkState,
    last_warning: Option<Instant>,
    reconfig_at: Option<Instant>,
}

impl ScpiSession {
    /// Start a session and send the initial configuration.
    ///
    /// `expected_idn` must appear in the device's `*IDN?` answer.
    pub fn new(
        label: &str,
        expected_idn: &str,
        channel: Arc<dyn FrameChannel>,
        timing: ScpiTiming,
    ) -> Self {
        let session = Self {
            label: format!("{} ({})", label, channel.describe()),
            expected_idn: expected_idn.to_string(),
            channel,
            timing,
            clock: Arc::new(Mutex::new(AskClock::default())),
            state: LinkState::Responsive,
            last_warning: None,
            reconfig_at: None,
        };
        session.initial_config();
        session
    }

    /// Label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current connectivity state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Send a command without expecting an answer.
    pub fn send(&self, command: &str) {
        debug!(device = %self.label, command, "SCPI send");
        self.channel.send_frame(command.as_bytes(), None);
    }

    /// Send a query. `handler` gets the trimmed answer; empty answers are ignored.
    pub fn ask<F>(&self, query: &str, handler: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        self.record_ask(Instant::now());
        let clock = self.clock.clone();
        let label = self.label.clone();
        let wrapped = Box::new(move |frame: Frame| {
            let text = match frame {
                Frame::Text(t) => t,
                Frame::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
            };
            let answer = text.trim();
            if answer.is_empty() {
                debug!(device = %label, "Ignoring empty SCPI answer");
                return;
            }
            clock
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last_response = Some(Instant::now());
            handler(answer.to_string());
        });
        self.channel.send_frame(query.as_bytes(), Some(wrapped));
    }

    /// Query `*IDN?` and check it against the expected identity.
    pub fn request_identity(&self) {
        let expected = self.expected_idn.clone();
        let label = self.label.clone();
        self.ask("*IDN?", move |idn| {
            if idn.contains(&expected) {
                info!(device = %label, idn = %idn, "SCPI device identified");
            } else {
                error!(
                    device = %label,
                    idn = %idn,
                    expected = %expected,
                    "Unexpected SCPI identity"
                );
            }
        });
    }

    /// Clear the device status registers.
    pub fn send_clear_status(&self) {
        self.send("*CLS");
    }

    /// Link-level setup followed by an identity check.
    pub fn initial_config(&self) {
        info!(device = %self.label, "Configuring SCPI device");
        self.channel.prepare();
        self.request_identity();
    }

    /// Whether the device is currently answering.
    pub fn responsive(&self) -> bool {
        self.responsive_at(Instant::now())
    }

    fn responsive_at(&self, now: Instant) -> bool {
        if !self.channel.is_connected() {
            return false;
        }
        let clock = *self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = self.timing.disconnect_timeout;
        match (clock.first_ask, clock.last_ask, clock.last_response) {
            (Some(first), Some(_), None) => now.saturating_duration_since(first) < limit,
            (_, Some(ask), Some(response)) if response < ask => {
                ask.saturating_duration_since(response) < limit
            }
            _ => true,
        }
    }

    /// Advance the state machine. Call once per instrument cycle.
    pub fn poll(&mut self) -> PollAction {
        self.poll_at(Instant::now())
    }

    fn poll_at(&mut self, now: Instant) -> PollAction {
        if self.state == LinkState::ReconfigPending {
            let settled = self
                .reconfig_at
                .is_some_and(|t| now.saturating_duration_since(t) >= self.timing.reconfig_pause);
            if settled {
                self.initial_config();
                self.state = LinkState::Responsive;
                self.reconfig_at = None;
            }
            return PollAction::Idle;
        }

        if !self.responsive_at(now) {
            self.state = LinkState::Unresponsive;
            let due = self
                .last_warning
                .map_or(true, |t| now.saturating_duration_since(t) >= self.timing.recheck_interval);
            if due {
                warn!(device = %self.label, "SCPI device appears to be disconnected");
                self.last_warning = Some(now);
                self.request_identity();
            }
            return PollAction::Idle;
        }

        if self.state == LinkState::Unresponsive {
            info!(device = %self.label, "SCPI device reconnected!");
            self.send_clear_status();
            self.state = LinkState::ReconfigPending;
            self.reconfig_at = Some(now);
            return PollAction::Idle;
        }
        PollAction::RequestData
    }

    fn record_ask(&self, now: Instant) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.first_ask.get_or_insert(now);
        clock.last_ask = Some(now);
    }

    #[cfg(test)]
    fn record_response(&self, now: Instant) {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_response = Some(now);
    }
}
