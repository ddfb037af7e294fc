use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::mpsc;

use warroom::audio::{
    AudioDevices, AudioFrame, DecodedBuffer, InputStream, OutputDevice, ScheduledVoice, VoiceId,
};
use warroom::net_link::{LiveChannel, LiveConnector, NetCommand, NetEvent};
use warroom::protocol::ServerMessage;
use warroom::{LiveSession, SessionError, SessionState};

const FRAME: usize = 4;

/// Remote side of a fake channel.
struct Peer {
    commands: mpsc::Receiver<NetCommand>,
    events: mpsc::Sender<NetEvent>,
}

#[derive(Default)]
struct Probe {
    clock: f64,
    deny_input: bool,
    fail_connect: bool,
    /// Frames the microphone delivers while the channel is still opening.
    frames_while_connecting: usize,
    input_opens: usize,
    input_arms: usize,
    input_stops: usize,
    output_opens: usize,
    output_closes: usize,
    connects: usize,
    scheduled: Vec<(VoiceId, f64, usize)>,
    stopped: Vec<VoiceId>,
    frames: Option<mpsc::Sender<AudioFrame>>,
    ended: Option<mpsc::UnboundedSender<VoiceId>>,
    peer: Option<Peer>,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Probe>>);

impl Shared {
    fn get(&self) -> MutexGuard<'_, Probe> {
        self.0.lock().unwrap()
    }

    fn take_peer(&self) -> Peer {
        self.get().peer.take().expect("channel was opened")
    }

    fn push_frame(&self, samples: Vec<f32>) {
        let frames = self.get().frames.clone().expect("input was opened");
        frames.try_send(AudioFrame::new(samples)).unwrap();
    }

    fn end_voice(&self, id: VoiceId) {
        let ended = self.get().ended.clone().expect("output was opened");
        ended.send(id).unwrap();
    }
}

struct FakeInput(Shared);

impl InputStream for FakeInput {
    fn arm(&mut self) {
        self.0.get().input_arms += 1;
    }

    fn stop(&mut self) {
        self.0.get().input_stops += 1;
    }
}

struct FakeOutput {
    probe: Shared,
    next_id: u64,
}

impl OutputDevice for FakeOutput {
    fn now(&self) -> f64 {
        self.probe.get().clock
    }

    fn schedule(&mut self, buffer: DecodedBuffer, start_at: f64) -> ScheduledVoice {
        let id = VoiceId(self.next_id);
        self.next_id += 1;
        self.probe.get().scheduled.push((id, start_at, buffer.len()));
        ScheduledVoice {
            id,
            start_at,
            end_at: start_at + buffer.duration(),
        }
    }

    fn stop(&mut self, voice: VoiceId) {
        let mut probe = self.probe.get();
        probe.stopped.push(voice);
        if let Some(ended) = &probe.ended {
            let _ = ended.send(voice);
        }
    }

    fn close(&mut self) {
        self.probe.get().output_closes += 1;
    }
}

struct FakeDevices(Shared);

impl AudioDevices for FakeDevices {
    type Input = FakeInput;
    type Output = FakeOutput;

    fn open_input(
        &mut self,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<FakeInput, SessionError> {
        let mut probe = self.0.get();
        if probe.deny_input {
            return Err(SessionError::PermissionDenied("NotAllowedError".into()));
        }
        probe.input_opens += 1;
        probe.frames = Some(frames);
        Ok(FakeInput(self.0.clone()))
    }

    fn open_output(
        &mut self,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Result<FakeOutput, SessionError> {
        let mut probe = self.0.get();
        probe.output_opens += 1;
        probe.ended = Some(ended);
        Ok(FakeOutput {
            probe: self.0.clone(),
            next_id: 0,
        })
    }
}

struct FakeConnector(Shared);

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self) -> Result<LiveChannel, SessionError> {
        let mut probe = self.0.get();
        probe.connects += 1;
        if let Some(frames) = &probe.frames {
            for _ in 0..probe.frames_while_connecting {
                let _ = frames.try_send(AudioFrame::new(vec![0.9; FRAME]));
            }
        }
        if probe.fail_connect {
            return Err(SessionError::ChannelOpenFailure("connection refused".into()));
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        probe.peer = Some(Peer {
            commands: cmd_rx,
            events: event_tx,
        });
        Ok(LiveChannel::new(cmd_tx, event_rx))
    }
}

type Session = LiveSession<FakeDevices, FakeConnector>;

fn session() -> (Session, Shared) {
    let probe = Shared::default();
    let session = LiveSession::new(
        FakeDevices(probe.clone()),
        FakeConnector(probe.clone()),
        FRAME,
        16000,
    );
    (session, probe)
}

async fn pump(session: &mut Session) {
    tokio::time::timeout(Duration::from_secs(1), session.pump())
        .await
        .expect("session event");
}

fn audio_message(samples: usize) -> NetEvent {
    let pcm: Vec<u8> = (0..samples)
        .flat_map(|i| ((i % 100) as i16 * 100).to_le_bytes())
        .collect();
    let json = format!(
        r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
        STANDARD.encode(pcm)
    );
    NetEvent::Server(ServerMessage::parse(&json).unwrap())
}

#[tokio::test]
async fn inbound_chunk_is_scheduled_at_now_and_cancelled_on_stop() {
    let (mut session, probe) = session();
    probe.get().clock = 3.0;

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Live);
    assert_eq!(session.status(), "Live");
    assert_eq!(session.playback_cursor(), Some(0.0));

    let mut peer = probe.take_peer();
    peer.events.send(audio_message(12_000)).await.unwrap();
    pump(&mut session).await;

    let (voice, start_at, len) = probe.get().scheduled[0];
    assert_eq!(start_at, 3.0);
    assert_eq!(len, 12_000);
    assert_eq!(session.playback_cursor(), Some(3.5));
    assert_eq!(session.active_buffers(), 1);

    session.stop();
    assert_eq!(probe.get().stopped, vec![voice]);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.status(), "Disconnected");
    assert!(matches!(peer.commands.recv().await, Some(NetCommand::Close)));
}

#[tokio::test]
async fn back_to_back_chunks_abut() {
    let (mut session, probe) = session();
    probe.get().clock = 1.0;
    session.start().await.unwrap();
    let peer = probe.take_peer();

    for _ in 0..3 {
        peer.events.send(audio_message(24_000)).await.unwrap();
    }
    for _ in 0..3 {
        pump(&mut session).await;
    }

    let starts: Vec<f64> = probe.get().scheduled.iter().map(|s| s.1).collect();
    assert_eq!(starts, vec![1.0, 2.0, 3.0]);
    assert_eq!(session.playback_cursor(), Some(4.0));
}

#[tokio::test]
async fn stop_twice_tears_down_once() {
    let (mut session, probe) = session();
    session.start().await.unwrap();

    session.stop();
    session.stop();

    let p = probe.get();
    assert_eq!(p.input_stops, 1);
    assert_eq!(p.output_closes, 1);
    drop(p);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn stop_in_idle_or_error_is_a_no_op() {
    let (mut session, probe) = session();
    session.stop();
    assert_eq!(session.state(), SessionState::Idle);

    probe.get().deny_input = true;
    assert!(session.start().await.is_err());
    session.stop();

    let p = probe.get();
    assert_eq!(p.input_stops, 0);
    assert_eq!(p.output_closes, 0);
    drop(p);
    assert_eq!(session.state(), SessionState::Error);
}

#[tokio::test]
async fn permission_denied_then_retry_goes_live() {
    let (mut session, probe) = session();
    probe.get().deny_input = true;

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::PermissionDenied(_)));
    assert_eq!(session.state(), SessionState::Error);
    assert_eq!(session.status(), "Permission Denied");
    assert_eq!(probe.get().connects, 0);

    probe.get().deny_input = false;
    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Live);
    assert_eq!(session.level(), 0.0);
    assert_eq!(probe.get().input_opens, 1);
}

#[tokio::test]
async fn restart_after_channel_error_starts_fresh() {
    let (mut session, probe) = session();
    probe.get().clock = 2.0;
    session.start().await.unwrap();
    let peer = probe.take_peer();

    probe.push_frame(vec![0.5, -0.5, 0.5, -0.5]);
    pump(&mut session).await;
    assert_eq!(session.level(), 50.0);

    peer.events.send(audio_message(2_400)).await.unwrap();
    pump(&mut session).await;
    assert!(session.playback_cursor().unwrap() > 2.0);

    peer.events
        .send(NetEvent::Failed("connection reset".into()))
        .await
        .unwrap();
    pump(&mut session).await;
    assert_eq!(session.state(), SessionState::Error);
    assert_eq!(session.status(), "Error");
    assert_eq!(probe.get().input_stops, 1);

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Live);
    assert_eq!(session.level(), 0.0);
    assert_eq!(session.playback_cursor(), Some(0.0));
    assert_eq!(session.active_buffers(), 0);
    assert_eq!(probe.get().input_opens, 2);
    assert_eq!(probe.get().output_opens, 2);
}

#[tokio::test]
async fn channel_open_failure_releases_devices() {
    let (mut session, probe) = session();
    probe.get().fail_connect = true;

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::ChannelOpenFailure(_)));
    assert_eq!(session.state(), SessionState::Error);
    assert_eq!(session.status(), "Connection Failed");

    let p = probe.get();
    assert_eq!(p.input_stops, 1);
    assert_eq!(p.output_closes, 1);
}

#[tokio::test]
async fn peer_close_ends_session_cleanly() {
    let (mut session, probe) = session();
    session.start().await.unwrap();
    let peer = probe.take_peer();

    peer.events
        .send(NetEvent::Closed(Some("code 1000".into())))
        .await
        .unwrap();
    pump(&mut session).await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.status(), "Disconnected");
    assert_eq!(probe.get().input_stops, 1);

    // Teardown already happened; a later stop does nothing more.
    session.stop();
    assert_eq!(probe.get().input_stops, 1);
}

#[tokio::test]
async fn captured_frames_are_sent_in_order() {
    let (mut session, probe) = session();
    session.start().await.unwrap();
    let mut peer = probe.take_peer();

    probe.push_frame(vec![0.0; FRAME]);
    probe.push_frame(vec![0.25; FRAME]);
    pump(&mut session).await;
    pump(&mut session).await;

    let mut levels = Vec::new();
    for _ in 0..2 {
        match peer.commands.recv().await {
            Some(NetCommand::Media(chunk)) => {
                assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
                levels.push(chunk.data().to_string());
            }
            other => panic!("expected media, got {:?}", other),
        }
    }
    assert_eq!(levels[0], STANDARD.encode([0u8; FRAME * 2]));
    assert_ne!(levels[0], levels[1]);
}

#[tokio::test]
async fn malformed_chunk_is_skipped() {
    let (mut session, probe) = session();
    session.start().await.unwrap();
    let peer = probe.take_peer();

    let msg = ServerMessage::parse(
        r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"%%%"}}]}}}"#,
    )
    .unwrap();
    peer.events.send(NetEvent::Server(msg)).await.unwrap();
    pump(&mut session).await;

    assert_eq!(session.state(), SessionState::Live);
    assert!(probe.get().scheduled.is_empty());
    assert_eq!(session.playback_cursor(), Some(0.0));
}

#[tokio::test]
async fn finished_buffers_leave_the_active_set() {
    let (mut session, probe) = session();
    session.start().await.unwrap();
    let peer = probe.take_peer();

    peer.events.send(audio_message(240)).await.unwrap();
    pump(&mut session).await;
    assert_eq!(session.active_buffers(), 1);

    let voice = probe.get().scheduled[0].0;
    probe.end_voice(voice);
    pump(&mut session).await;
    assert_eq!(session.active_buffers(), 0);

    session.stop();
    assert!(probe.get().stopped.is_empty());
}

#[tokio::test]
async fn start_while_live_is_ignored() {
    let (mut session, probe) = session();
    session.start().await.unwrap();
    session.start().await.unwrap();

    assert_eq!(session.state(), SessionState::Live);
    assert_eq!(probe.get().connects, 1);
    assert_eq!(probe.get().input_opens, 1);
}

#[tokio::test]
async fn audio_captured_while_connecting_is_not_sent() {
    let (mut session, probe) = session();
    probe.get().frames_while_connecting = 3;

    session.start().await.unwrap();
    assert_eq!(probe.get().input_arms, 1);
    let mut peer = probe.take_peer();

    probe.push_frame(vec![0.0; FRAME]);
    pump(&mut session).await;
    assert_eq!(session.level(), 0.0);

    match peer.commands.try_recv() {
        Ok(NetCommand::Media(chunk)) => {
            assert_eq!(chunk.data(), STANDARD.encode([0u8; FRAME * 2]))
        }
        other => panic!("expected the silent frame, got {:?}", other),
    }
    assert!(peer.commands.try_recv().is_err());
}

#[tokio::test]
async fn vanished_link_is_a_channel_error() {
    let (mut session, probe) = session();
    session.start().await.unwrap();

    drop(probe.take_peer());
    pump(&mut session).await;

    assert_eq!(session.state(), SessionState::Error);
    assert_eq!(session.status(), "Error");
    assert_eq!(probe.get().input_stops, 1);
}
