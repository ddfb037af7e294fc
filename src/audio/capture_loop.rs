//! Per-frame send path: meter, encode, push to the channel.

use super::pcm_codec::{AudioFrame, PcmEncoder};
use crate::net_link::{LiveChannel, SendOutcome};

/// Root mean square of `samples`; 0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Map an RMS value onto the 0–100 meter scale.
pub fn meter_level(rms: f32) -> f32 {
    if rms.is_nan() {
        return 0.0;
    }
    (rms * 100.0).clamp(0.0, 100.0)
}

/// Runs once per captured frame. Never blocks: frames the channel cannot
/// take right now are dropped.
pub struct CaptureLoop {
    encoder: PcmEncoder,
    level: f32,
    frames_sent: u64,
    frames_dropped: u64,
}

impl CaptureLoop {
    pub fn new(encoder: PcmEncoder) -> Self {
        Self {
            encoder,
            level: 0.0,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    pub fn on_frame(&mut self, frame: &AudioFrame, channel: &LiveChannel) {
        self.level = meter_level(rms(frame.samples()));

        let chunk = self.encoder.encode(frame);
        match channel.send_media(chunk) {
            SendOutcome::Queued => self.frames_sent += 1,
            SendOutcome::Full => {
                self.frames_dropped += 1;
                log::warn!(
                    "Outbound queue full, dropped frame ({} dropped so far)",
                    self.frames_dropped
                );
            }
            // The channel reports its own closure through its event stream.
            SendOutcome::Closed => self.frames_dropped += 1,
        }
    }

    /// Latest meter value, 0–100.
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}
