//! ALSA output device with a sample-accurate playback timeline.
//!
//! Scheduled buffers are placed on a timeline measured in frames rendered
//! since the device was opened. The playback thread renders one period at a
//! time, so the device clock is `rendered_frames / sample_rate`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use super::alsa_device;
use super::device::{OutputDevice, ScheduledVoice, VoiceId};
use super::pcm_codec::DecodedBuffer;
use crate::config::AudioConfig;

const MAX_RECOVERY_RETRIES: u32 = 3;

struct Voice {
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Frame-indexed schedule shared between the session and the playback thread.
#[derive(Default)]
pub(crate) struct Timeline {
    position: u64,
    voices: BTreeMap<VoiceId, Voice>,
}

impl Timeline {
    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    /// Place `samples` at `start_frame` and return where they actually start.
    /// A start already in the past plays from the current position instead.
    pub(crate) fn insert(&mut self, id: VoiceId, start_frame: u64, samples: Vec<f32>) -> u64 {
        let start_frame = start_frame.max(self.position);
        self.voices.insert(
            id,
            Voice {
                start_frame,
                samples,
            },
        );
        start_frame
    }

    pub(crate) fn remove(&mut self, id: VoiceId) -> bool {
        self.voices.remove(&id).is_some()
    }

    /// Render the next `out.len()` frames, advance the clock, and return the
    /// voices that finished inside this period.
    pub(crate) fn render(&mut self, out: &mut [f32]) -> Vec<VoiceId> {
        out.fill(0.0);
        let period_start = self.position;
        let period_end = period_start + out.len() as u64;

        for voice in self.voices.values() {
            let from = voice.start_frame.max(period_start);
            let to = voice.end_frame().min(period_end);
            for frame in from..to {
                out[(frame - period_start) as usize] +=
                    voice.samples[(frame - voice.start_frame) as usize];
            }
        }

        let finished: Vec<VoiceId> = self
            .voices
            .iter()
            .filter(|(_, voice)| voice.end_frame() <= period_end)
            .map(|(id, _)| *id)
            .collect();
        for id in &finished {
            self.voices.remove(id);
        }

        self.position = period_end;
        finished
    }
}

fn lock(timeline: &Mutex<Timeline>) -> MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Output device over a shared `Timeline`. Whoever renders the timeline
/// drives the clock.
pub(crate) struct TimelineOutput {
    timeline: Arc<Mutex<Timeline>>,
    ended: mpsc::UnboundedSender<VoiceId>,
    sample_rate: u32,
    next_id: u64,
}

impl TimelineOutput {
    pub(crate) fn new(
        timeline: Arc<Mutex<Timeline>>,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Self {
        Self {
            timeline,
            ended,
            sample_rate: sample_rate.max(1),
            next_id: 0,
        }
    }

    fn seconds(&self, frame: u64) -> f64 {
        frame as f64 / self.sample_rate as f64
    }
}

impl OutputDevice for TimelineOutput {
    fn now(&self) -> f64 {
        self.seconds(lock(&self.timeline).position())
    }

    fn schedule(&mut self, buffer: DecodedBuffer, start_at: f64) -> ScheduledVoice {
        let id = VoiceId(self.next_id);
        self.next_id += 1;

        if buffer.sample_rate() != self.sample_rate {
            log::debug!(
                "Resampling {:?} from {}Hz to {}Hz",
                id,
                buffer.sample_rate(),
                self.sample_rate
            );
        }
        let samples = buffer.resampled(self.sample_rate).into_samples();
        let len = samples.len() as u64;
        let requested = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;

        // The playback thread may have rendered since `now`; the timeline
        // decides the real start under its own lock.
        let start_frame = lock(&self.timeline).insert(id, requested, samples);

        ScheduledVoice {
            id,
            start_at: self.seconds(start_frame),
            end_at: self.seconds(start_frame + len),
        }
    }

    fn stop(&mut self, voice: VoiceId) {
        if lock(&self.timeline).remove(voice) {
            let _ = self.ended.send(voice);
        }
    }

    fn close(&mut self) {}
}

/// ALSA playback device driven by a `Timeline`.
pub struct AlsaOutput {
    output: TimelineOutput,
    running: Arc<AtomicBool>,
    play_handle: Option<JoinHandle<()>>,
}

impl AlsaOutput {
    /// Open the playback device and start rendering silence.
    pub fn start(config: &AudioConfig, ended: mpsc::UnboundedSender<VoiceId>) -> Result<Self> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<u32>>(1);

        let play_handle = {
            let timeline = timeline.clone();
            let running = running.clone();
            let ended = ended.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || {
                    if let Err(e) = play_thread(&config, &timeline, &running, &ended, &ready_tx) {
                        log::error!("Playback thread error: {:#}", e);
                        let _ = ready_tx.try_send(Err(e));
                    }
                })?
        };

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = play_handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = play_handle.join();
                anyhow::bail!("playback thread exited before opening the device");
            }
        };

        Ok(Self {
            output: TimelineOutput::new(timeline, sample_rate, ended),
            running,
            play_handle: Some(play_handle),
        })
    }
}

impl OutputDevice for AlsaOutput {
    fn now(&self) -> f64 {
        self.output.now()
    }

    fn schedule(&mut self, buffer: DecodedBuffer, start_at: f64) -> ScheduledVoice {
        self.output.schedule(buffer, start_at)
    }

    fn stop(&mut self, voice: VoiceId) {
        self.output.stop(voice);
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.play_handle.take() {
            let _ = handle.join();
            log::info!("Playback device released");
        }
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

// ======================== Playback thread ========================

fn play_thread(
    config: &AudioConfig,
    timeline: &Mutex<Timeline>,
    running: &AtomicBool,
    ended: &mpsc::UnboundedSender<VoiceId>,
    ready: &std::sync::mpsc::SyncSender<Result<u32>>,
) -> Result<()> {
    let (pcm, params) = alsa_device::open_playback(
        &config.playback_device,
        config.output_sample_rate,
        1,
        Some(config.playback_period_size),
    )?;

    if params.sample_rate != config.output_sample_rate {
        anyhow::bail!(
            "playback device '{}' runs at {}Hz, {}Hz required",
            config.playback_device,
            params.sample_rate,
            config.output_sample_rate
        );
    }

    let io = pcm.io_i16().context("Failed to get playback I/O")?;
    let period = params.period_size.max(1);
    let mut mix = vec![0f32; period];
    let mut pcm_data = vec![0i16; period];

    let _ = ready.send(Ok(params.sample_rate));

    log::info!(
        "Playback started: rate={}, period={}",
        params.sample_rate,
        period
    );

    while running.load(Ordering::Relaxed) {
        let finished = lock(timeline).render(&mut mix);
        for id in finished {
            let _ = ended.send(id);
        }

        for (dst, src) in pcm_data.iter_mut().zip(&mix) {
            *dst = (src * 32767.0) as i16;
        }

        // Write with retry to handle short writes and XRUN recovery.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&pcm_data[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    if let Err(e2) = pcm.prepare() {
                        anyhow::bail!("Failed to recover PCM playback: {}", e2);
                    }

                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    let _ = pcm.drop();
    log::info!("Playback stopped");
    Ok(())
}
