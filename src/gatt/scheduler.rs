//! Delivery scheduler
//!
//! Drains payload from the ring transport and sends it to the peer as
//! notifications, one negotiated chunk at a time. Pacing, peer readiness
//! and link back-pressure all come back from [`DeliveryScheduler::deliver`]
//! as a [`DeliveryOutcome`]; the run loop turns each outcome into a wait.

use serde::Serialize;
use std::time::{Duration, Instant};

use super::link::{chunk_size_for_mtu, Clock, LinkEvent, RadioLink};
use super::service::ServiceEndpoint;
use crate::audio::buffer::RingTransport;
use crate::config::DeliveryConfig;
use crate::error::{LinkError, SessionError, Stage, TransportError};
use crate::pipeline::StreamSignals;
use crate::protocol::ControlCommand;

/// Pacing and backoff parameters
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub min_interval: Duration,
    pub chunk_floor: usize,
    pub chunk_ceiling: usize,
    pub overflow_step: Duration,
    pub overflow_linear_tiers: u32,
    pub overflow_cooldown: Duration,
    pub idle_wait_min: Duration,
    pub idle_wait_max: Duration,
    pub read_deadline: Duration,
}

impl From<&DeliveryConfig> for DeliveryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            chunk_floor: config.chunk_floor,
            chunk_ceiling: config.chunk_ceiling,
            overflow_step: Duration::from_millis(config.overflow_step_ms),
            overflow_linear_tiers: config.overflow_linear_tiers,
            overflow_cooldown: Duration::from_millis(config.overflow_cooldown_ms),
            idle_wait_min: Duration::from_millis(config.idle_wait_min_ms),
            idle_wait_max: Duration::from_millis(config.idle_wait_max_ms),
            read_deadline: config.read_deadline(),
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl DeliveryPolicy {
    /// Backoff for the given consecutive overflow count, and whether the
    /// count should reset afterwards
    pub fn overflow_backoff(&self, failures: u32) -> (Duration, bool) {
        if failures <= self.overflow_linear_tiers {
            (self.overflow_step * failures, false)
        } else {
            (self.overflow_cooldown, true)
        }
    }

    /// Next wait while the peer is not ready
    pub fn next_idle_wait(&self, current: Duration) -> Duration {
        (current * 2).clamp(self.idle_wait_min, self.idle_wait_max)
    }
}

/// Per-connection delivery state; lives from connect to disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySession {
    pub peer_subscribed: bool,
    pub last_send_time: Option<Instant>,
    pub consecutive_failures: u32,
    pub negotiated_chunk_size: usize,
    pub mtu: Option<u16>,
}

impl DeliverySession {
    pub fn new(mtu: Option<u16>, policy: &DeliveryPolicy) -> Self {
        Self {
            peer_subscribed: false,
            last_send_time: None,
            consecutive_failures: 0,
            negotiated_chunk_size: chunk_size_for_mtu(mtu, policy.chunk_floor, policy.chunk_ceiling),
            mtu,
        }
    }

    pub fn set_mtu(&mut self, mtu: u16, policy: &DeliveryPolicy) {
        self.mtu = Some(mtu);
        self.negotiated_chunk_size = chunk_size_for_mtu(self.mtu, policy.chunk_floor, policy.chunk_ceiling);
        tracing::debug!(mtu, chunk = self.negotiated_chunk_size, "Chunk size renegotiated");
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// This many bytes from the front of the slice went out
    BytesSent(usize),
    /// Peer is not subscribed; nothing was sent
    NotReady,
    /// Too soon after the previous send
    RateLimited { retry_in: Duration },
    /// Link buffers full; wait `backoff` before retrying
    Overflow { failures: u32, backoff: Duration },
    Fatal(LinkError),
}

/// Why the delivery loop returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryEnd {
    /// Producer finished and every byte was sent
    Drained,
    /// STOP command
    Stopped,
    Cancelled,
}

/// Delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub bytes_sent: u64,
    pub notifications: u64,
    pub rate_limited: u64,
    pub not_ready: u64,
    pub overflows: u64,
    pub cooldowns: u64,
}

/// Outcome of a delivery run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub end: DeliveryEnd,
    pub stats: DeliveryStats,
}

/// Paces payload onto a radio link
pub struct DeliveryScheduler<L: RadioLink, C: Clock> {
    link: L,
    clock: C,
    policy: DeliveryPolicy,
    stats: DeliveryStats,
}

impl<L: RadioLink, C: Clock> DeliveryScheduler<L, C> {
    pub fn new(link: L, clock: C, policy: DeliveryPolicy) -> Self {
        Self {
            link,
            clock,
            policy,
            stats: DeliveryStats::default(),
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Try to send the front of `payload`, at most one negotiated chunk
    pub fn deliver(&mut self, payload: &[u8], session: &mut DeliverySession) -> DeliveryOutcome {
        if !session.peer_subscribed {
            self.stats.not_ready += 1;
            return DeliveryOutcome::NotReady;
        }

        let now = self.clock.now();
        if let Some(last) = session.last_send_time {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.policy.min_interval {
                self.stats.rate_limited += 1;
                return DeliveryOutcome::RateLimited {
                    retry_in: self.policy.min_interval - elapsed,
                };
            }
        }

        if payload.is_empty() {
            return DeliveryOutcome::BytesSent(0);
        }

        let len = payload.len().min(session.negotiated_chunk_size);
        match self.link.notify(&payload[..len]) {
            Ok(()) => {
                session.last_send_time = Some(now);
                session.consecutive_failures = 0;
                self.stats.bytes_sent += len as u64;
                self.stats.notifications += 1;
                DeliveryOutcome::BytesSent(len)
            }
            Err(LinkError::Overflow) => {
                session.consecutive_failures += 1;
                let failures = session.consecutive_failures;
                let (backoff, reset) = self.policy.overflow_backoff(failures);
                self.stats.overflows += 1;

                if reset {
                    tracing::warn!(failures, "Too many link buffer overflows, cooling down for {:?}", backoff);
                    session.consecutive_failures = 0;
                    self.stats.cooldowns += 1;
                } else {
                    tracing::debug!(failures, "Link buffer full, backing off {:?}", backoff);
                }
                DeliveryOutcome::Overflow { failures, backoff }
            }
            Err(LinkError::NotConnected) => {
                self.stats.not_ready += 1;
                DeliveryOutcome::NotReady
            }
            Err(error) => {
                tracing::error!(%error, "Link failure during delivery");
                DeliveryOutcome::Fatal(error)
            }
        }
    }

    /// Run until the producer is drained, a STOP arrives, the stream is
    /// cancelled, or the peer disconnects mid-delivery.
    pub fn run(
        &mut self,
        ring: &RingTransport,
        endpoint: &ServiceEndpoint,
        signals: &StreamSignals,
    ) -> Result<DeliveryReport, SessionError> {
        let mut session: Option<DeliverySession> = None;
        let mut pending: Vec<u8> = Vec::with_capacity(self.policy.chunk_ceiling);
        let mut scratch = vec![0u8; self.policy.chunk_ceiling];
        let mut idle_wait = self.policy.idle_wait_min;

        let result = loop {
            if signals.is_cancelled() {
                break Ok(DeliveryEnd::Cancelled);
            }

            // Link events create, update and destroy the session. A drop
            // after the first notification ends the run even if the peer
            // is already back later in the same batch.
            let mut lost = false;
            for event in endpoint.events.try_iter() {
                match event {
                    LinkEvent::Connected { mtu } => {
                        session = Some(DeliverySession::new(mtu, &self.policy));
                    }
                    LinkEvent::MtuChanged(mtu) => {
                        if let Some(s) = session.as_mut() {
                            s.set_mtu(mtu, &self.policy);
                        }
                    }
                    LinkEvent::Subscribed(subscribed) => {
                        if let Some(s) = session.as_mut() {
                            s.peer_subscribed = subscribed;
                        }
                    }
                    LinkEvent::Disconnected => {
                        session = None;
                        if self.stats.bytes_sent > 0 {
                            lost = true;
                            break;
                        }
                    }
                }
            }

            if lost || (session.is_none() && self.stats.bytes_sent > 0) {
                break Err(LinkError::Disconnected);
            }

            let mut stop = false;
            for control in endpoint.commands.try_iter() {
                if control.command == ControlCommand::Stop {
                    stop = true;
                }
                endpoint.apply(control);
            }
            if stop {
                ring.clear();
                pending.clear();
                break Ok(DeliveryEnd::Stopped);
            }

            let ready = endpoint.playback().playing
                && session.as_ref().map_or(false, |s| s.peer_subscribed);
            let Some(active) = session.as_mut().filter(|_| ready) else {
                endpoint.set_streaming(false);
                self.clock.sleep(idle_wait);
                idle_wait = self.policy.next_idle_wait(idle_wait);
                continue;
            };
            idle_wait = self.policy.idle_wait_min;

            if pending.is_empty() {
                if signals.producer_done() && ring.is_empty() {
                    break Ok(DeliveryEnd::Drained);
                }

                let want = active.negotiated_chunk_size.min(scratch.len());
                let deadline = Instant::now() + self.policy.read_deadline;
                match ring.read_blocking(&mut scratch[..want], deadline) {
                    Ok(n) => pending.extend_from_slice(&scratch[..n]),
                    Err(TransportError::Timeout) | Err(TransportError::Cleared) => continue,
                }
            }

            endpoint.set_streaming(true);
            match self.deliver(&pending, active) {
                DeliveryOutcome::BytesSent(n) => {
                    pending.drain(..n);
                }
                DeliveryOutcome::NotReady => {
                    self.clock.sleep(idle_wait);
                    idle_wait = self.policy.next_idle_wait(idle_wait);
                }
                DeliveryOutcome::RateLimited { retry_in } => self.clock.sleep(retry_in),
                DeliveryOutcome::Overflow { backoff, .. } => self.clock.sleep(backoff),
                DeliveryOutcome::Fatal(error) => break Err(error),
            }
        };

        endpoint.set_streaming(false);
        match result {
            Ok(end) => {
                tracing::info!(?end, bytes_sent = self.stats.bytes_sent, "Delivery finished");
                Ok(DeliveryReport {
                    end,
                    stats: self.stats.clone(),
                })
            }
            Err(error) => {
                // Wake a producer blocked on a full ring
                ring.clear();
                tracing::error!(%error, bytes_sent = self.stats.bytes_sent, "Delivery failed");
                Err(SessionError::new(Stage::Delivery, self.stats.bytes_sent, error))
            }
        }
    }
}
