//! Device seams used by the live session.
//!
//! A session opens one input stream and one output device per attempt and
//! drops both when it leaves `Live`. The ALSA implementations live in
//! `record` and `play`.

use tokio::sync::mpsc;

use super::pcm_codec::{AudioFrame, DecodedBuffer};
use crate::config::AudioConfig;
use crate::error::SessionError;

/// Handle of one buffer scheduled on an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

/// Span a buffer occupies on the device clock, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledVoice {
    pub id: VoiceId,
    pub start_at: f64,
    pub end_at: f64,
}

/// A running capture stream. Frames are delivered through the sender given
/// to `AudioDevices::open_input`.
pub trait InputStream {
    /// Begin delivering frames. Audio captured before this is discarded.
    fn arm(&mut self);

    /// Stop the stream and release the device. Must be idempotent.
    fn stop(&mut self);
}

/// An output device that plays buffers at absolute device-clock times.
pub trait OutputDevice {
    /// Current device clock in seconds.
    fn now(&self) -> f64;

    /// Schedule `buffer` to start no earlier than `start_at` seconds on the
    /// device clock and return the span it was actually given. A start the
    /// clock has already passed is moved up to the clock. The id is reported
    /// on the ended channel once the buffer has finished or was stopped.
    fn schedule(&mut self, buffer: DecodedBuffer, start_at: f64) -> ScheduledVoice;

    /// Stop a scheduled buffer immediately.
    fn stop(&mut self, voice: VoiceId);

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// Factory for the per-session devices.
pub trait AudioDevices {
    type Input: InputStream;
    type Output: OutputDevice;

    /// Request microphone access and start delivering frames.
    fn open_input(
        &mut self,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Self::Input, SessionError>;

    /// Open the speaker. Ended voices are reported on `ended`.
    fn open_output(
        &mut self,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Result<Self::Output, SessionError>;
}

/// ALSA-backed devices for capture (16 kHz) and playback (24 kHz).
pub struct AlsaDevices {
    config: AudioConfig,
}

impl AlsaDevices {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioDevices for AlsaDevices {
    type Input = super::record::AlsaInput;
    type Output = super::play::AlsaOutput;

    fn open_input(
        &mut self,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Self::Input, SessionError> {
        super::record::AlsaInput::start(&self.config, frames)
            .map_err(|e| SessionError::PermissionDenied(format!("{:#}", e)))
    }

    fn open_output(
        &mut self,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Result<Self::Output, SessionError> {
        super::play::AlsaOutput::start(&self.config, ended)
            .map_err(|e| SessionError::PermissionDenied(format!("{:#}", e)))
    }
}
