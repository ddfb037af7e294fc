//! Opening mono S16LE PCM streams for the capture and playback threads.
//!
//! The hardware may not grant exactly what was asked for; callers compare
//! the returned `AlsaParams` against the rates the live stream needs.

use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// What the device actually agreed to.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames moved per `readi`/`writei` call.
    pub period_size: usize,
}

pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, period_size)
}

pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, channels, period_size)
}

fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    }
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let what = direction_name(direction);
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("cannot open {} device '{}'", what, device))?;

    let hwp = HwParams::any(&pcm)
        .with_context(|| format!("{} device '{}' has no usable configuration", what, device))?;
    hwp.set_access(Access::RWInterleaved)?;
    hwp.set_format(Format::S16LE)
        .with_context(|| format!("{} device '{}' does not take S16LE", what, device))?;
    hwp.set_channels(channels)
        .with_context(|| format!("{} device '{}' rejects {} channel(s)", what, device, channels))?;
    hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
    if let Some(frames) = period_size {
        hwp.set_period_size_near(frames as Frames, ValueOr::Nearest)?;
    }
    pcm.hw_params(&hwp)
        .with_context(|| format!("{} device '{}' refused its parameters", what, device))?;
    drop(hwp);

    let granted = pcm.hw_params_current()?;
    let params = AlsaParams {
        sample_rate: granted.get_rate()?,
        channels: granted.get_channels()?,
        period_size: granted.get_period_size()? as usize,
    };
    drop(granted);

    log::info!(
        "Opened {} '{}': {}Hz x{} ch, {} frames/period",
        what,
        device,
        params.sample_rate,
        params.channels,
        params.period_size
    );
    Ok((pcm, params))
}
