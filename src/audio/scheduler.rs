//! Gapless, in-order playback of decoded chunks.
//!
//! Each buffer starts at `max(cursor, now)` and moves the cursor to its end,
//! so consecutive buffers abut exactly and never overlap. If the stream went
//! quiet long enough for the device clock to pass the cursor, the next
//! buffer simply starts at `now`.
//!
//! The cursor always follows the span the device reports back, not the
//! requested start, so a clock that advanced in between cannot make two
//! buffers overlap.

use std::collections::BTreeSet;

use super::device::{OutputDevice, ScheduledVoice, VoiceId};
use super::pcm_codec::DecodedBuffer;

pub struct PlaybackScheduler<O: OutputDevice> {
    output: O,
    cursor: f64,
    active: BTreeSet<VoiceId>,
    closed: bool,
}

impl<O: OutputDevice> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            cursor: 0.0,
            active: BTreeSet::new(),
            closed: false,
        }
    }

    /// Schedule `buffer` right after everything already queued.
    ///
    /// Returns `None` for empty buffers or after `close`; the cursor is left
    /// untouched in both cases.
    pub fn enqueue(&mut self, buffer: DecodedBuffer) -> Option<ScheduledVoice> {
        if self.closed || buffer.is_empty() {
            return None;
        }

        let start_at = self.cursor.max(self.output.now());
        let voice = self.output.schedule(buffer, start_at);
        if voice.start_at > start_at {
            log::debug!(
                "Device clock passed {:.3}s, {:?} starts at {:.3}s",
                start_at,
                voice.id,
                voice.start_at
            );
        }

        self.cursor = self.cursor.max(voice.end_at);
        self.active.insert(voice.id);
        Some(voice)
    }

    /// Completion notice from the output device.
    pub fn on_ended(&mut self, id: VoiceId) {
        self.active.remove(&id);
    }

    /// Stop every buffer that has not finished yet.
    pub fn stop_all(&mut self) {
        let active = std::mem::take(&mut self.active);
        if !active.is_empty() {
            log::debug!("Stopping {} scheduled buffer(s)", active.len());
        }
        for id in active {
            self.output.stop(id);
        }
    }

    /// Stop everything and release the output device.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_all();
        self.output.close();
        self.closed = true;
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: VoiceId) -> bool {
        self.active.contains(&id)
    }
}
