//! Fixed-size wire records of the audio service
//!
//! Records are encoded with bincode's fixed-int little-endian layout, which
//! matches the packed structs a peer expects on the characteristics.

use bincode::Options;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::ContainerFormat;
use crate::error::{ControlError, Result};

/// Audio service
pub const AUDIO_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_9abc_def012345678);
/// Payload notifications
pub const AUDIO_DATA_UUID: Uuid = Uuid::from_u128(0x12345679_1234_5678_9abc_def012345678);
/// Control writes
pub const AUDIO_CONTROL_UUID: Uuid = Uuid::from_u128(0x1234567a_1234_5678_9abc_def012345678);
/// Format info reads
pub const AUDIO_INFO_UUID: Uuid = Uuid::from_u128(0x1234567b_1234_5678_9abc_def012345678);

/// Highest accepted volume
pub const MAX_VOLUME: u8 = 100;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Commands accepted on the control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlCommand {
    Play = 0x01,
    Pause = 0x02,
    Stop = 0x03,
    Volume = 0x04,
    Mute = 0x05,
    Unmute = 0x06,
}

impl TryFrom<u8> for ControlCommand {
    type Error = ControlError;

    fn try_from(value: u8) -> std::result::Result<Self, ControlError> {
        match value {
            0x01 => Ok(ControlCommand::Play),
            0x02 => Ok(ControlCommand::Pause),
            0x03 => Ok(ControlCommand::Stop),
            0x04 => Ok(ControlCommand::Volume),
            0x05 => Ok(ControlCommand::Mute),
            0x06 => Ok(ControlCommand::Unmute),
            other => Err(ControlError::UnknownCommand(other)),
        }
    }
}

/// Raw 4-byte control record: command, volume, two reserved bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub command: u8,
    pub volume: u8,
    pub reserved: [u8; 2],
}

impl ControlRecord {
    pub const LEN: usize = 4;

    pub fn new(command: ControlCommand, volume: u8) -> Self {
        Self {
            command: command as u8,
            volume,
            reserved: [0; 2],
        }
    }

    /// Decode a control write; the length must be exact
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ControlError> {
        if bytes.len() != Self::LEN {
            return Err(ControlError::InvalidLength { len: bytes.len() });
        }
        codec()
            .deserialize(bytes)
            .map_err(|_| ControlError::InvalidLength { len: bytes.len() })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }

    /// Validate into a typed command
    pub fn command(&self) -> std::result::Result<ControlCommand, ControlError> {
        let command = ControlCommand::try_from(self.command)?;
        if command == ControlCommand::Volume && self.volume > MAX_VOLUME {
            return Err(ControlError::VolumeOutOfRange(self.volume));
        }
        Ok(command)
    }
}

/// 10-byte format record exposed on the info characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormatRecord {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frame_size: u16,
}

impl FormatRecord {
    pub const LEN: usize = 10;

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(ControlError::InvalidLength { len: bytes.len() }.into());
        }
        Ok(codec().deserialize(bytes)?)
    }
}

impl From<&ContainerFormat> for FormatRecord {
    fn from(format: &ContainerFormat) -> Self {
        Self {
            sample_rate: format.sample_rate_hz,
            channels: format.channel_count,
            bits_per_sample: format.bits_per_sample,
            frame_size: format.frame_size() as u16,
        }
    }
}
