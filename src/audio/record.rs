use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::alsa_device;
use super::device::InputStream;
use super::pcm_codec::AudioFrame;
use crate::config::AudioConfig;

/// Microphone stream on a dedicated thread. Delivers `frame_size`-sample
/// frames of normalized mono audio once armed; until then the device keeps
/// reading and throws the audio away.
pub struct AlsaInput {
    running: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
    record_handle: Option<JoinHandle<()>>,
}

impl AlsaInput {
    /// Open the capture device. Returns once the device is open, so access
    /// failures surface here rather than on the thread.
    pub fn start(config: &AudioConfig, frames: mpsc::Sender<AudioFrame>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let armed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);

        let record_handle = {
            let running = running.clone();
            let armed = armed.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    if let Err(e) = record_thread(&config, frames, &running, &armed, &ready_tx) {
                        log::error!("Recording thread error: {:#}", e);
                        let _ = ready_tx.try_send(Err(e));
                    }
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                running,
                armed,
                record_handle: Some(record_handle),
            }),
            Ok(Err(e)) => {
                let _ = record_handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = record_handle.join();
                anyhow::bail!("capture thread exited before opening the device")
            }
        }
    }
}

impl InputStream for AlsaInput {
    fn arm(&mut self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.record_handle.take() {
            let _ = h.join();
            log::info!("Capture device released");
        }
    }
}

impl Drop for AlsaInput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record_thread(
    config: &AudioConfig,
    frames_tx: mpsc::Sender<AudioFrame>,
    running: &AtomicBool,
    armed: &AtomicBool,
    ready: &std::sync::mpsc::SyncSender<Result<()>>,
) -> Result<()> {
    // 1. Open ALSA capture device, mono at the outbound rate
    let (pcm, params) = alsa_device::open_capture(
        &config.capture_device,
        config.input_sample_rate,
        1,
        Some(config.capture_period_size),
    )?;

    if params.sample_rate != config.input_sample_rate {
        anyhow::bail!(
            "capture device '{}' runs at {}Hz, {}Hz required",
            config.capture_device,
            params.sample_rate,
            config.input_sample_rate
        );
    }

    let io = pcm.io_i16().context("Failed to get capture I/O")?;
    let period_size = params.period_size.max(1);
    let frame_size = config.frame_size;

    // Accumulation buffer, drained one frame at a time
    let mut accum_buf: Vec<i16> = Vec::with_capacity(frame_size * 2);
    let mut read_buf = vec![0i16; period_size];

    let _ = ready.send(Ok(()));

    log::info!(
        "Recording started: rate={}, period={}, frame_size={}",
        params.sample_rate,
        period_size,
        frame_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(n) => {
                if !armed.load(Ordering::Relaxed) {
                    continue;
                }
                accum_buf.extend_from_slice(&read_buf[..n]);

                while accum_buf.len() >= frame_size {
                    let samples = accum_buf
                        .drain(..frame_size)
                        .map(|s| s as f32 / 32768.0)
                        .collect();
                    match frames_tx.try_send(AudioFrame::new(samples)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            log::warn!("Session is behind, dropping captured frame");
                        }
                        Err(TrySendError::Closed(_)) => {
                            log::info!("Frame receiver dropped, stopping capture");
                            return Ok(());
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    anyhow::bail!("Failed to recover PCM capture: {}", e2);
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}
