//! Live voice session: lifecycle state machine and the per-session
//! resource bundle.
//!
//! Everything a session owns (input stream, output device, scheduler,
//! channel) lives in one `LiveResources` value that is built on `start` and
//! dropped when the session leaves `Live`, so nothing leaks from one
//! attempt into the next.
//!
//! The session is driven by a single task: `next_event` waits for the next
//! captured frame, server message or playback-completion notice, and
//! `handle_event` applies it. Only `start` suspends.

use std::fmt;

use tokio::sync::mpsc;

use crate::audio::{
    AudioDevices, AudioFrame, CaptureLoop, InputStream, OutputDevice, PcmDecoder, PcmEncoder,
    PlaybackScheduler, VoiceId,
};
use crate::error::SessionError;
use crate::net_link::{LiveChannel, LiveConnector, NetEvent};
use crate::protocol::ServerMessage;

const FRAME_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Live,
    Error,
    Closed,
}

impl SessionState {
    /// Whether the start control is enabled in this state.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Closed | SessionState::Error
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Live => "Live",
            SessionState::Error => "Error",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// One unit of work for the session loop.
#[derive(Debug)]
pub enum SessionEvent {
    Frame(AudioFrame),
    Net(NetEvent),
    PlaybackEnded(VoiceId),
}

/// Resources owned by one live attempt.
struct LiveResources<I, O: OutputDevice> {
    input: I,
    frames: mpsc::Receiver<AudioFrame>,
    capture: CaptureLoop,
    scheduler: PlaybackScheduler<O>,
    ended: mpsc::UnboundedReceiver<VoiceId>,
    decoder: PcmDecoder,
    channel: LiveChannel,
}

impl<I: InputStream, O: OutputDevice> LiveResources<I, O> {
    /// Release device tracks, scheduled buffers and the channel.
    fn teardown(&mut self) {
        self.input.stop();
        self.scheduler.close();
        self.channel.close();
        log::info!(
            "Session resources released ({} frames sent, {} dropped)",
            self.capture.frames_sent(),
            self.capture.frames_dropped()
        );
    }
}

pub struct LiveSession<D: AudioDevices, C: LiveConnector> {
    devices: D,
    connector: C,
    frame_size: usize,
    input_sample_rate: u32,
    state: SessionState,
    status: String,
    live: Option<LiveResources<D::Input, D::Output>>,
}

impl<D: AudioDevices, C: LiveConnector> LiveSession<D, C> {
    pub fn new(devices: D, connector: C, frame_size: usize, input_sample_rate: u32) -> Self {
        Self {
            devices,
            connector,
            frame_size,
            input_sample_rate,
            state: SessionState::Idle,
            status: "Disconnected".to_string(),
            live: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// User-facing status line.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Microphone loudness on a 0–100 scale; 0 when not live.
    pub fn level(&self) -> f32 {
        self.live
            .as_ref()
            .map_or(0.0, |live| live.capture.level())
    }

    /// Device-clock time at which the next inbound buffer may start.
    pub fn playback_cursor(&self) -> Option<f64> {
        self.live.as_ref().map(|live| live.scheduler.cursor())
    }

    /// Buffers scheduled and not yet finished.
    pub fn active_buffers(&self) -> usize {
        self.live
            .as_ref()
            .map_or(0, |live| live.scheduler.active_len())
    }

    fn set_state(&mut self, state: SessionState, status: &str) {
        if self.state != state {
            log::info!("Session state: {} -> {} ({})", self.state, state, status);
        }
        self.state = state;
        self.status = status.to_string();
    }

    /// Open devices and the live channel. On failure the session lands in
    /// `Error` with the cause in the status line.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if !self.state.can_start() {
            log::warn!("start ignored while session is {}", self.state);
            return Ok(());
        }

        // Any leftovers from a previous attempt go before anything new opens.
        self.teardown();
        self.set_state(SessionState::Connecting, "Connecting...");

        match self.open().await {
            Ok(live) => {
                self.live = Some(live);
                self.set_state(SessionState::Live, "Live");
                Ok(())
            }
            Err(e) => {
                log::error!("Session start failed: {}", e);
                self.set_state(SessionState::Error, e.status_text());
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<LiveResources<D::Input, D::Output>, SessionError> {
        let (frames_tx, mut frames) = mpsc::channel(FRAME_QUEUE);
        let (ended_tx, ended) = mpsc::unbounded_channel();

        let mut input = self.devices.open_input(frames_tx)?;
        let output = match self.devices.open_output(ended_tx) {
            Ok(output) => output,
            Err(e) => {
                input.stop();
                return Err(e);
            }
        };
        let mut scheduler = PlaybackScheduler::new(output);

        let channel = match self.connector.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                input.stop();
                scheduler.close();
                return Err(e);
            }
        };

        // Capture only counts from here on; anything recorded while
        // connecting is stale.
        let mut stale = 0;
        while frames.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            log::debug!("Discarded {} frame(s) captured while connecting", stale);
        }
        input.arm();

        Ok(LiveResources {
            input,
            frames,
            capture: CaptureLoop::new(PcmEncoder::new(self.frame_size, self.input_sample_rate)),
            scheduler,
            ended,
            decoder: PcmDecoder::new(),
            channel,
        })
    }

    /// Stop the session from any state. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.teardown() {
            self.set_state(SessionState::Closed, "Disconnected");
        }
    }

    /// Release the current resource bundle, if any.
    fn teardown(&mut self) -> bool {
        match self.live.take() {
            Some(mut live) => {
                live.teardown();
                true
            }
            None => false,
        }
    }

    /// Wait for the next event. Pends forever while not live.
    pub async fn next_event(&mut self) -> SessionEvent {
        let Some(live) = self.live.as_mut() else {
            return std::future::pending().await;
        };

        tokio::select! {
            Some(frame) = live.frames.recv() => SessionEvent::Frame(frame),
            Some(id) = live.ended.recv() => SessionEvent::PlaybackEnded(id),
            event = live.channel.recv() => SessionEvent::Net(event),
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Frame(frame) => self.handle_frame(&frame),
            SessionEvent::Net(event) => self.handle_net_event(event),
            SessionEvent::PlaybackEnded(id) => {
                if let Some(live) = self.live.as_mut() {
                    live.scheduler.on_ended(id);
                }
            }
        }
    }

    /// Wait for one event and apply it.
    pub async fn pump(&mut self) {
        let event = self.next_event().await;
        self.handle_event(event);
    }

    fn handle_frame(&mut self, frame: &AudioFrame) {
        if let Some(live) = self.live.as_mut() {
            live.capture.on_frame(frame, &live.channel);
        }
    }

    fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Server(msg) => self.handle_server_message(&msg),
            NetEvent::Closed(reason) => {
                log::info!(
                    "{} ({})",
                    SessionError::PeerClosed,
                    reason.as_deref().unwrap_or("no reason")
                );
                if self.teardown() {
                    self.set_state(SessionState::Closed, SessionError::PeerClosed.status_text());
                }
            }
            NetEvent::Failed(reason) => {
                let err = SessionError::ChannelError(reason);
                log::error!("{}", err);
                if self.teardown() {
                    self.set_state(SessionState::Error, err.status_text());
                }
            }
        }
    }

    fn handle_server_message(&mut self, msg: &ServerMessage) {
        let Some(live) = self.live.as_mut() else {
            return;
        };

        if let Some(chunk) = msg.audio_chunk() {
            let buffer = live.decoder.decode(&chunk);
            match live.scheduler.enqueue(buffer) {
                Some(voice) => log::debug!(
                    "Scheduled {:?} at {:.3}s..{:.3}s",
                    voice.id,
                    voice.start_at,
                    voice.end_at
                ),
                None => log::debug!("Skipping empty audio chunk"),
            }
        }

        if msg.interrupted() {
            log::info!("Model turn interrupted");
        }
        if msg.turn_complete() {
            log::debug!("Model turn complete");
        }
        if let Some(go_away) = &msg.go_away {
            log::warn!(
                "Server will close the session soon (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }
    }
}

impl<D: AudioDevices, C: LiveConnector> Drop for LiveSession<D, C> {
    fn drop(&mut self) {
        self.teardown();
    }
}
