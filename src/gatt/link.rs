//! Radio link seam
//!
//! The host radio stack owns connections, advertising and pairing. This
//! module only models what delivery needs from it: a way to send one
//! notification, the events it reports, and a clock to pace against.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::LinkError;

/// ATT header bytes in every notification
pub const ATT_HEADER_LEN: usize = 3;
/// Default ATT MTU every peer supports
pub const ATT_MTU_MIN: u16 = 23;
/// Largest ATT MTU used by the service
pub const ATT_MTU_MAX: u16 = 247;

/// Payload size for a negotiated MTU, falling back to `floor` when no MTU
/// is confirmed
pub fn chunk_size_for_mtu(mtu: Option<u16>, floor: usize, ceiling: usize) -> usize {
    match mtu {
        Some(mtu) if usize::from(mtu) > ATT_HEADER_LEN => {
            (usize::from(mtu) - ATT_HEADER_LEN).clamp(floor, ceiling)
        }
        _ => floor,
    }
}

/// Something that can push a notification to the subscribed peer
pub trait RadioLink {
    /// Send one notification on the audio data characteristic
    fn notify(&mut self, payload: &[u8]) -> Result<(), LinkError>;
}

/// Events reported by the host stack for the single peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// `mtu` is set only when an exchange has been confirmed
    Connected { mtu: Option<u16> },
    MtuChanged(u16),
    Subscribed(bool),
    Disconnected,
}

/// Time source for pacing and backoff
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

struct ManualState {
    now: Instant,
    sleeps: Vec<Duration>,
}

/// Clock that only moves when something sleeps on it; records every sleep.
///
/// Part of the crate's testing surface, for driving a
/// [`DeliveryScheduler`](super::DeliveryScheduler) in integration tests and
/// offline simulations. Production code uses [`SystemClock`].
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.state.lock().now += duration;
    }

    /// Every sleep requested so far
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.lock().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.now += duration;
        state.sleeps.push(duration);
    }
}

/// Stand-in for the host stack that writes notification payloads to any
/// `Write`, with injectable failures
pub struct SimulatedLink<W: Write> {
    out: W,
    connected: bool,
    failures: VecDeque<LinkError>,
    notifications: u64,
    bytes: u64,
}

impl<W: Write> SimulatedLink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            connected: true,
            failures: VecDeque::new(),
            notifications: 0,
            bytes: 0,
        }
    }

    /// Fail the next sends with these errors, in order
    pub fn inject<I: IntoIterator<Item = LinkError>>(&mut self, errors: I) {
        self.failures.extend(errors);
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn notifications(&self) -> u64 {
        self.notifications
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RadioLink for SimulatedLink<W> {
    fn notify(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        if let Some(error) = self.failures.pop_front() {
            return Err(error);
        }
        if !self.connected {
            return Err(LinkError::Disconnected);
        }

        self.out.write_all(payload).map_err(|e| {
            tracing::error!("Simulated link write failed: {}", e);
            LinkError::Stack(e.raw_os_error().unwrap_or(-5))
        })?;

        self.notifications += 1;
        self.bytes += payload.len() as u64;
        tracing::trace!(len = payload.len(), "Notification sent");
        Ok(())
    }
}
