//! Audio GATT service state
//!
//! The host stack calls into [`AudioService`] from its own callback context.
//! Nothing here touches the audio pipeline directly: link events and control
//! commands are queued on bounded channels and consumed by the delivery task
//! through its [`ServiceEndpoint`].

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::link::LinkEvent;
use crate::codec::ContainerFormat;
use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::protocol::{ControlCommand, ControlRecord, FormatRecord};

/// Client Characteristic Configuration bit enabling notifications
pub const CCC_NOTIFY: u16 = 0x0001;

/// A validated control write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub command: ControlCommand,
    pub volume: u8,
}

/// Playback state driven by control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackState {
    pub playing: bool,
    pub volume: u8,
    pub muted: bool,
}

impl PlaybackState {
    /// Apply a non-STOP command
    pub fn apply(&mut self, control: Control) {
        match control.command {
            ControlCommand::Play => self.playing = true,
            ControlCommand::Pause => self.playing = false,
            ControlCommand::Stop => self.playing = false,
            ControlCommand::Volume => self.volume = control.volume,
            ControlCommand::Mute => self.muted = true,
            ControlCommand::Unmute => self.muted = false,
        }
    }
}

struct Shared {
    format: Mutex<Option<ContainerFormat>>,
    playback: Mutex<PlaybackState>,
    streaming: AtomicBool,
}

/// Link-facing half of the audio service
#[derive(Clone)]
pub struct AudioService {
    events: Sender<LinkEvent>,
    commands: Sender<Control>,
    shared: Arc<Shared>,
}

/// Delivery-facing half of the audio service
pub struct ServiceEndpoint {
    pub events: Receiver<LinkEvent>,
    pub commands: Receiver<Control>,
    shared: Arc<Shared>,
}

impl AudioService {
    pub fn new(config: &ControlConfig) -> (Self, ServiceEndpoint) {
        let (events_tx, events_rx) = bounded(config.event_queue_depth);
        let (commands_tx, commands_rx) = bounded(config.queue_depth);
        let shared = Arc::new(Shared {
            format: Mutex::new(None),
            playback: Mutex::new(PlaybackState {
                playing: true,
                volume: config.initial_volume,
                muted: false,
            }),
            streaming: AtomicBool::new(false),
        });

        let service = Self {
            events: events_tx,
            commands: commands_tx,
            shared: shared.clone(),
        };
        let endpoint = ServiceEndpoint {
            events: events_rx,
            commands: commands_rx,
            shared,
        };
        (service, endpoint)
    }

    fn push_event(&self, event: LinkEvent) {
        match self.events.try_send(event) {
            Ok(()) => tracing::debug!(?event, "Link event queued"),
            Err(TrySendError::Full(event)) => tracing::error!(?event, "Link event queue full, event dropped"),
            Err(TrySendError::Disconnected(_)) => tracing::debug!(?event, "No delivery task, link event ignored"),
        }
    }

    pub fn on_connected(&self, mtu: Option<u16>) {
        tracing::info!(?mtu, "Peer connected");
        self.push_event(LinkEvent::Connected { mtu });
    }

    pub fn on_disconnected(&self) {
        tracing::info!("Peer disconnected");
        self.push_event(LinkEvent::Disconnected);
    }

    pub fn on_mtu_changed(&self, mtu: u16) {
        tracing::info!(mtu, "MTU exchanged");
        self.push_event(LinkEvent::MtuChanged(mtu));
    }

    /// CCC descriptor write on the audio data characteristic
    pub fn on_subscription_changed(&self, ccc: u16) {
        let subscribed = ccc & CCC_NOTIFY != 0;
        tracing::info!(subscribed, "Audio notifications {}", if subscribed { "enabled" } else { "disabled" });
        self.push_event(LinkEvent::Subscribed(subscribed));
    }

    /// Write on the control characteristic. Never blocks the link context.
    pub fn on_control_write(&self, bytes: &[u8]) -> std::result::Result<(), ControlError> {
        let record = ControlRecord::decode(bytes)?;
        let control = Control {
            command: record.command()?,
            volume: record.volume,
        };

        match self.commands.try_send(control) {
            Ok(()) => {
                tracing::debug!(?control, "Control command queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(?control, "Control queue full");
                Err(ControlError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(ControlError::Closed),
        }
    }

    /// Read on the info characteristic: the current format record
    pub fn read_info(&self) -> Result<Vec<u8>> {
        let record = self
            .shared
            .format
            .lock()
            .as_ref()
            .map(FormatRecord::from)
            .unwrap_or_default();
        record.encode()
    }

    /// Read on the control characteristic
    pub fn read_status(&self) -> &'static str {
        if self.shared.streaming.load(Ordering::Acquire) {
            "STREAMING"
        } else {
            "READY"
        }
    }

    /// Publish the format of the stream being delivered
    pub fn set_format(&self, format: ContainerFormat) {
        tracing::info!(
            sample_rate = format.sample_rate_hz,
            channels = format.channel_count,
            bits = format.bits_per_sample,
            "Audio format updated"
        );
        *self.shared.format.lock() = Some(format);
    }

    pub fn format(&self) -> Option<ContainerFormat> {
        *self.shared.format.lock()
    }

    pub fn playback(&self) -> PlaybackState {
        *self.shared.playback.lock()
    }
}

impl ServiceEndpoint {
    pub fn set_streaming(&self, streaming: bool) {
        self.shared.streaming.store(streaming, Ordering::Release);
    }

    pub fn playback(&self) -> PlaybackState {
        *self.shared.playback.lock()
    }

    /// Apply a command to the shared playback state
    pub fn apply(&self, control: Control) -> PlaybackState {
        let mut playback = self.shared.playback.lock();
        playback.apply(control);
        tracing::info!(command = ?control.command, state = ?*playback, "Control command applied");
        *playback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (AudioService, ServiceEndpoint) {
        AudioService::new(&ControlConfig {
            queue_depth: 2,
            ..ControlConfig::default()
        })
    }

    #[test]
    fn test_control_write_queues_command() {
        let (service, endpoint) = service();
        service.on_control_write(&[0x04, 30, 0, 0]).unwrap();

        let control = endpoint.commands.try_recv().unwrap();
        assert_eq!(control.command, ControlCommand::Volume);

        let state = endpoint.apply(control);
        assert_eq!(state.volume, 30);
        assert_eq!(service.playback().volume, 30);
    }

    #[test]
    fn test_control_write_validation() {
        let (service, _endpoint) = service();
        assert_eq!(service.on_control_write(&[1, 0]), Err(ControlError::InvalidLength { len: 2 }));
        assert_eq!(service.on_control_write(&[0x42, 0, 0, 0]), Err(ControlError::UnknownCommand(0x42)));
    }

    #[test]
    fn test_full_queue_does_not_block() {
        let (service, _endpoint) = service();
        service.on_control_write(&[0x01, 0, 0, 0]).unwrap();
        service.on_control_write(&[0x02, 0, 0, 0]).unwrap();
        assert_eq!(service.on_control_write(&[0x01, 0, 0, 0]), Err(ControlError::QueueFull));
    }

    #[test]
    fn test_subscription_events() {
        let (service, endpoint) = service();
        service.on_connected(None);
        service.on_subscription_changed(CCC_NOTIFY);
        service.on_subscription_changed(0);

        let events: Vec<_> = endpoint.events.try_iter().collect();
        assert_eq!(
            events,
            vec![
                LinkEvent::Connected { mtu: None },
                LinkEvent::Subscribed(true),
                LinkEvent::Subscribed(false),
            ]
        );
    }

    #[test]
    fn test_info_and_status() {
        let (service, endpoint) = service();
        assert_eq!(service.read_info().unwrap(), vec![0; FormatRecord::LEN]);
        assert_eq!(service.read_status(), "READY");

        service.set_format(ContainerFormat::pcm(1, 16000, 16));
        let info = service.read_info().unwrap();
        assert_eq!(&info[0..4], &16000u32.to_le_bytes());

        endpoint.set_streaming(true);
        assert_eq!(service.read_status(), "STREAMING");
    }

    #[test]
    fn test_playback_state() {
        let mut state = PlaybackState {
            playing: true,
            volume: 80,
            muted: false,
        };
        state.apply(Control {
            command: ControlCommand::Pause,
            volume: 0,
        });
        state.apply(Control {
            command: ControlCommand::Mute,
            volume: 0,
        });
        assert!(!state.playing);
        assert!(state.muted);
        assert_eq!(state.volume, 80);
    }
}
