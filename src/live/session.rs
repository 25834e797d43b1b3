//! # Live Session Controller
//!
//! Lifecycle and message routing for one realtime voice session.
//!
//! ## State Machine:
//! ```text
//! Idle ──connect()──► Connecting ──setupComplete──► Open ──┬─ disconnect() ─► Closed
//!   ▲                     │                                ├─ remote close ─►
//!   └─ permission denied  └─ transport failure / timeout ─►└─ transport error ►
//! ```
//!
//! ## Concurrency:
//! Once open, a single driver task owns the playback scheduler, the transport
//! channel and the capture pipeline. Inbound events, decode completions,
//! playback completions, outbound packets and control commands all funnel
//! through its `select!` loop, so the playback cursor and active source set
//! are only ever touched from one place.
//!
//! Observers read a [`SessionMonitor`] (status snapshot plus an event
//! broadcast) and never take the session itself.

use crate::audio::buffer::AudioBuffer;
use crate::audio::capture::{CaptureDevice, CapturePipeline, CaptureSpec, EncodedPacket};
use crate::audio::codec;
use crate::audio::output::{AudioOutput, CompletionReceiver, OutputFactory};
use crate::audio::reorder::ReorderBuffer;
use crate::audio::scheduler::PlaybackScheduler;
use crate::live::error::{LiveError, LiveResult};
use crate::live::protocol::{ClientMessage, ServerEvent, ServerMessage, Speaker};
use crate::live::transport::{LiveChannel, LiveConnector, TransportEvent};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One line of the running transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl TranscriptEntry {
    /// Display form, e.g. `Mind: hello`.
    pub fn line(&self) -> String {
        format!("{}: {}", self.speaker.label(), self.text)
    }
}

/// Per-session traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub packets_sent: u64,
    pub chunks_received: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub interruptions: u64,
    pub malformed_messages: u64,
}

/// Observable status of the current (or last) session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub is_active: bool,
    pub capture: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub counters: SessionCounters,
    pub transcript: Vec<TranscriptEntry>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            is_active: false,
            capture: None,
            started_at: None,
            closed_at: None,
            close_reason: None,
            counters: SessionCounters::default(),
            transcript: Vec::new(),
        }
    }
}

/// Notifications pushed to live observers (`/ws/live`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged { session_id: Uuid, state: SessionState },
    Transcript { session_id: Uuid, speaker: Speaker, text: String },
    Interrupted { session_id: Uuid, stopped: usize },
    ChunkDropped { session_id: Uuid, seq: u64, reason: String },
    TurnComplete { session_id: Uuid },
    Closed { session_id: Uuid, reason: Option<String> },
}

/// Shared, read-mostly view of a session.
#[derive(Debug, Clone)]
pub struct SessionMonitor {
    status: Arc<RwLock<SessionStatus>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMonitor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            status: Arc::new(RwLock::new(SessionStatus::default())),
            events,
        }
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn transcript_lines(&self) -> Vec<String> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .transcript
            .iter()
            .map(TranscriptEntry::line)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionStatus) -> R) -> R {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *status)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn count(&self, f: impl FnOnce(&mut SessionCounters)) {
        self.update(|status| f(&mut status.counters));
    }

    /// Start a fresh record for a new session in `Connecting`.
    fn begin(&self, session_id: Uuid, capture: String) {
        self.update(|status| {
            *status = SessionStatus {
                session_id: Some(session_id),
                state: SessionState::Connecting,
                capture: Some(capture),
                started_at: Some(Utc::now()),
                ..SessionStatus::default()
            };
        });
        self.emit(SessionEvent::StateChanged {
            session_id,
            state: SessionState::Connecting,
        });
    }

    fn set_state(&self, session_id: Uuid, state: SessionState) {
        self.update(|status| {
            status.state = state;
            status.is_active = state == SessionState::Open;
        });
        self.emit(SessionEvent::StateChanged { session_id, state });
    }

    fn finish(&self, session_id: Uuid, reason: Option<String>) {
        self.update(|status| {
            status.state = SessionState::Closed;
            status.is_active = false;
            status.closed_at = Some(Utc::now());
            status.close_reason = reason.clone();
        });
        self.emit(SessionEvent::StateChanged {
            session_id,
            state: SessionState::Closed,
        });
        self.emit(SessionEvent::Closed { session_id, reason });
    }

    fn push_transcript(&self, session_id: Uuid, speaker: Speaker, text: String) {
        self.update(|status| {
            status.transcript.push(TranscriptEntry {
                speaker,
                text: text.clone(),
                at: Utc::now(),
            })
        });
        self.emit(SessionEvent::Transcript {
            session_id,
            speaker,
            text,
        });
    }
}

/// Platform collaborators of a session.
#[derive(Clone)]
pub struct LiveDeps {
    pub connector: Arc<dyn LiveConnector>,
    pub capture: Arc<dyn CaptureDevice>,
    pub output: Arc<dyn OutputFactory>,
}

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSettings {
    pub model: String,
    pub system_instruction: Option<String>,
    pub transcribe_input: bool,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub outbound_queue_capacity: usize,
    pub max_reorder_pending: usize,
    pub connect_timeout: Duration,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            system_instruction: None,
            transcribe_input: false,
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 4096,
            outbound_queue_capacity: 32,
            max_reorder_pending: 64,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Turns one inbound audio payload into a buffer at the given sample rate.
pub(crate) type ChunkDecoder = Arc<dyn Fn(String, u32) -> BoxFuture<'static, LiveResult<AudioBuffer>> + Send + Sync>;

fn pcm_decoder() -> ChunkDecoder {
    Arc::new(|data: String, sample_rate: u32| -> BoxFuture<'static, LiveResult<AudioBuffer>> {
        Box::pin(async move { codec::decode_base64_pcm(&data, sample_rate, 1) })
    })
}

/// Device opens can block on the audio driver, so they run off the async workers.
async fn open_blocking<T, F>(open: F) -> LiveResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> LiveResult<T> + Send + 'static,
{
    task::spawn_blocking(open)
        .await
        .map_err(|e| LiveError::Permission(format!("device open failed: {}", e)))?
}

enum Control {
    Disconnect,
}

struct DriverHandle {
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

/// One realtime voice session.
///
/// `connect()` and `disconnect()` take `&mut self`; callers that share a
/// session across tasks wrap it in a mutex (see `LiveHub`).
pub struct LiveSession {
    deps: LiveDeps,
    monitor: SessionMonitor,
    decoder: ChunkDecoder,
    session_id: Option<Uuid>,
    driver: Option<DriverHandle>,
}

impl LiveSession {
    pub fn new(deps: LiveDeps, monitor: SessionMonitor) -> Self {
        Self {
            deps,
            monitor,
            decoder: pcm_decoder(),
            session_id: None,
            driver: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_decoder(mut self, decoder: ChunkDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn state(&self) -> SessionState {
        self.monitor.state()
    }

    pub fn is_active(&self) -> bool {
        self.monitor.is_active()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    pub fn transcript(&self) -> Vec<String> {
        self.monitor.transcript_lines()
    }

    /// Open capture, playback and the remote channel, then start streaming.
    ///
    /// The handshake is abandoned when `cancel` resolves first, which is how a
    /// disconnect reaches a session that is still `Connecting`.
    ///
    /// ## Errors:
    /// - `Permission`: capture or output could not be opened; state unchanged
    /// - `Transport`: the channel failed, timed out or was cancelled; state
    ///   becomes `Closed`
    ///
    /// Connecting an already open session is a no-op.
    pub async fn connect(&mut self, settings: &LiveSettings, cancel: impl Future<Output = ()>) -> LiveResult<()> {
        if self.is_active() && self.driver.as_ref().is_some_and(|d| !d.task.is_finished()) {
            debug!("Session already open");
            return Ok(());
        }

        let capture = Arc::clone(&self.deps.capture);
        let capture_spec = CaptureSpec {
            sample_rate: settings.input_sample_rate,
            frame_size: settings.frame_size,
        };
        let mut stream = open_blocking(move || capture.open(&capture_spec)).await.map_err(|e| {
            warn!("Capture unavailable: {}", e);
            e
        })?;

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let factory = Arc::clone(&self.deps.output);
        let output_rate = settings.output_sample_rate;
        let output = open_blocking(move || factory.open(output_rate, completion_tx))
            .await
            .map_err(|e| {
                warn!("Playback unavailable: {}", e);
                e
            })?;

        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        self.monitor.begin(session_id, self.deps.capture.describe());
        info!(%session_id, model = %settings.model, "Connecting live session");

        let setup = ClientMessage::setup(
            &settings.model,
            settings.system_instruction.as_deref(),
            settings.transcribe_input,
        );
        let handshake = tokio::time::timeout(settings.connect_timeout, self.deps.connector.connect(setup));
        let connected = tokio::select! {
            result = handshake => result.unwrap_or_else(|_| {
                Err(LiveError::Transport(format!(
                    "no setup acknowledgement within {:?}",
                    settings.connect_timeout
                )))
            }),
            _ = cancel => Err(LiveError::Transport("connect cancelled by disconnect".to_string())),
        };
        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => return Err(self.abort_connect(session_id, output, e)),
        };

        // Streaming starts at Open; audio from the handshake is never sent
        let discarded = stream.discard_pending();
        if discarded > 0 {
            debug!(%session_id, discarded, "Dropped frames captured while connecting");
        }

        let (packet_tx, packet_rx) = mpsc::channel(settings.outbound_queue_capacity.max(1));
        let capture = CapturePipeline::spawn(stream, settings.input_sample_rate, packet_tx);
        let (control_tx, control_rx) = mpsc::channel(4);

        // Open must be published before the driver can publish Closed
        self.monitor.set_state(session_id, SessionState::Open);
        info!(%session_id, "Live session open");

        let driver = Driver {
            session_id,
            monitor: self.monitor.clone(),
            scheduler: PlaybackScheduler::new(output),
            channel,
            capture,
            packets: packet_rx,
            completions: completion_rx,
            control: control_rx,
            decoder: Arc::clone(&self.decoder),
            decodes: JoinSet::new(),
            in_flight: HashMap::new(),
            reorder: ReorderBuffer::new(settings.max_reorder_pending),
            next_seq: 0,
            output_rate: settings.output_sample_rate,
        };
        self.driver = Some(DriverHandle {
            control: control_tx,
            task: tokio::spawn(driver.run()),
        });
        Ok(())
    }

    fn abort_connect(
        &mut self,
        session_id: Uuid,
        mut output: Box<dyn AudioOutput>,
        err: LiveError,
    ) -> LiveError {
        error!(%session_id, "Live session failed to open: {}", err);
        output.close();
        self.monitor.finish(session_id, Some(err.to_string()));
        err
    }

    /// Tear the session down. Safe from any state and idempotent.
    pub async fn disconnect(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };

        // The driver may already be gone after a remote close
        let _ = driver.control.send(Control::Disconnect).await;
        if let Err(e) = driver.task.await {
            if !e.is_cancelled() {
                error!("Live session driver failed: {}", e);
            }
            if let Some(session_id) = self.session_id {
                if self.monitor.state() != SessionState::Closed {
                    self.monitor.finish(session_id, Some("driver failed".to_string()));
                }
            }
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            // Closing the control channel makes the driver tear down on its own
            let _ = driver.control.try_send(Control::Disconnect);
        }
    }
}

/// Owns every piece of mutable session state while the session is open.
struct Driver {
    session_id: Uuid,
    monitor: SessionMonitor,
    scheduler: PlaybackScheduler,
    channel: LiveChannel,
    capture: CapturePipeline,
    packets: mpsc::Receiver<EncodedPacket>,
    completions: CompletionReceiver,
    control: mpsc::Receiver<Control>,
    decoder: ChunkDecoder,
    decodes: JoinSet<LiveResult<AudioBuffer>>,
    /// Sequence number of each running decode
    in_flight: HashMap<task::Id, u64>,
    reorder: ReorderBuffer<Option<AudioBuffer>>,
    next_seq: u64,
    output_rate: u32,
}

impl Driver {
    async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                command = self.control.recv() => match command {
                    Some(Control::Disconnect) | None => break None,
                },
                Some(packet) = self.packets.recv() => {
                    if self.channel.outbound.send(ClientMessage::audio(&packet)).await.is_err() {
                        break Some("outbound channel closed".to_string());
                    }
                    self.monitor.count(|c| c.packets_sent += 1);
                }
                event = self.channel.inbound.recv() => match event {
                    Some(TransportEvent::Message(message)) => self.on_message(message),
                    Some(TransportEvent::Malformed(e)) => {
                        warn!(session_id = %self.session_id, "Skipping malformed message: {}", e);
                        self.monitor.count(|c| c.malformed_messages += 1);
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        break Some(format!(
                            "closed by remote: {}",
                            reason.unwrap_or_else(|| "no reason given".to_string())
                        ));
                    }
                    Some(TransportEvent::Failed(e)) => break Some(e.to_string()),
                    None => break Some("transport ended".to_string()),
                },
                Some(joined) = self.decodes.join_next_with_id() => self.on_decoded(joined),
                Some(id) = self.completions.recv() => {
                    self.scheduler.on_buffer_finished(id);
                }
            }
        };

        self.teardown(reason).await;
    }

    fn on_message(&mut self, message: ServerMessage) {
        for event in message.into_events(self.output_rate) {
            match event {
                ServerEvent::SetupComplete => debug!("Duplicate setupComplete ignored"),
                ServerEvent::Transcription { speaker, text } => {
                    self.monitor.push_transcript(self.session_id, speaker, text);
                }
                ServerEvent::Interrupted => {
                    let stopped = self.scheduler.on_interrupt();
                    self.monitor.count(|c| c.interruptions += 1);
                    self.monitor.emit(SessionEvent::Interrupted {
                        session_id: self.session_id,
                        stopped,
                    });
                }
                ServerEvent::Audio { data, sample_rate } => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.monitor.count(|c| c.chunks_received += 1);
                    let decode = self.decodes.spawn((self.decoder)(data, sample_rate));
                    self.in_flight.insert(decode.id(), seq);
                }
                ServerEvent::TurnComplete => self.monitor.emit(SessionEvent::TurnComplete {
                    session_id: self.session_id,
                }),
                ServerEvent::GoAway { time_left } => {
                    warn!(session_id = %self.session_id, ?time_left, "Service will close the session soon");
                }
            }
        }
    }

    fn on_decoded(&mut self, joined: Result<(task::Id, LiveResult<AudioBuffer>), JoinError>) {
        let (id, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(session_id = %self.session_id, "Decode task failed: {}", e);
                (e.id(), Err(LiveError::Decode(format!("decode task failed: {}", e))))
            }
        };
        let Some(seq) = self.in_flight.remove(&id) else {
            return;
        };

        match result {
            Ok(buffer) => {
                self.reorder.insert(seq, Some(buffer));
            }
            Err(e) => {
                warn!(session_id = %self.session_id, seq, "Dropping undecodable chunk: {}", e);
                self.monitor.count(|c| c.chunks_dropped += 1);
                self.monitor.emit(SessionEvent::ChunkDropped {
                    session_id: self.session_id,
                    seq,
                    reason: e.to_string(),
                });
                // Keep the slot so later chunks are not held back
                self.reorder.insert(seq, None);
            }
        }

        for buffer in self.reorder.drain_ready().into_iter().flatten() {
            if self.scheduler.schedule(buffer).is_some() {
                self.monitor.count(|c| c.chunks_scheduled += 1);
            }
        }
    }

    /// Release everything, then report the session closed.
    async fn teardown(mut self, reason: Option<String>) {
        self.capture.stop();
        self.decodes.abort_all();
        self.in_flight.clear();
        self.reorder.reset(self.next_seq);

        let stopped = self.scheduler.on_interrupt();
        self.scheduler.close();

        let Driver {
            session_id,
            monitor,
            channel,
            ..
        } = self;
        channel.close().await;

        match &reason {
            Some(reason) => warn!(%session_id, stopped, "Live session closed: {}", reason),
            None => info!(%session_id, stopped, "Live session disconnected"),
        }
        monitor.finish(session_id, reason);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::capture::tests::ScriptedCapture;
    use crate::audio::capture::NoCapture;
    use crate::audio::output::VirtualOutput;
    use std::future::pending;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Connector handing out one pre-built in-memory channel.
    #[derive(Default)]
    pub(crate) struct ChannelConnector {
        channel: Mutex<Option<LiveChannel>>,
        pub setups: Mutex<Vec<ClientMessage>>,
        pub attempts: AtomicUsize,
        pub hang: bool,
    }

    /// Test-side ends of an in-memory channel.
    pub(crate) struct RemoteEnd {
        pub events: mpsc::Sender<TransportEvent>,
        pub received: mpsc::Receiver<ClientMessage>,
    }

    impl ChannelConnector {
        pub fn with_channel() -> (Arc<Self>, RemoteEnd) {
            let (out_tx, out_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            let connector = Self {
                channel: Mutex::new(Some(LiveChannel::new(out_tx, in_rx))),
                ..Self::default()
            };
            (
                Arc::new(connector),
                RemoteEnd {
                    events: in_tx,
                    received: out_rx,
                },
            )
        }

        pub fn hanging() -> Arc<Self> {
            Arc::new(Self {
                hang: true,
                ..Self::default()
            })
        }
    }

    impl LiveConnector for ChannelConnector {
        fn connect(&self, setup: ClientMessage) -> BoxFuture<'static, LiveResult<LiveChannel>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.setups.lock().unwrap().push(setup);
            if self.hang {
                return Box::pin(futures_util::future::pending());
            }
            let channel = self.channel.lock().unwrap().take();
            Box::pin(async move { channel.ok_or_else(|| LiveError::Transport("refused".to_string())) })
        }
    }

    pub(crate) fn deps(
        connector: Arc<ChannelConnector>,
        capture: Arc<dyn CaptureDevice>,
        output: VirtualOutput,
    ) -> LiveDeps {
        LiveDeps {
            connector,
            capture,
            output: Arc::new(output),
        }
    }

    fn message(json: serde_json::Value) -> TransportEvent {
        TransportEvent::Message(ServerMessage::parse(&json.to_string()).unwrap())
    }

    /// One model turn carrying a silent chunk per duration, in order.
    fn audio_turn(durations: &[f64]) -> TransportEvent {
        let parts: Vec<serde_json::Value> = durations
            .iter()
            .map(|duration| {
                let frames = (24_000.0 * duration).round() as usize;
                let data = codec::encode_base64_pcm(&vec![0.0; frames]);
                serde_json::json!({ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": data } })
            })
            .collect();
        message(serde_json::json!({ "serverContent": { "modelTurn": { "parts": parts } } }))
    }

    fn audio(duration_secs: f64) -> TransportEvent {
        audio_turn(&[duration_secs])
    }

    /// Real decoding, then a wait of half the chunk's duration, so longer
    /// chunks finish decoding later than shorter ones.
    fn slow_decoder() -> ChunkDecoder {
        Arc::new(|data: String, sample_rate: u32| -> BoxFuture<'static, LiveResult<AudioBuffer>> {
            Box::pin(async move {
                let buffer = codec::decode_base64_pcm(&data, sample_rate, 1)?;
                tokio::time::sleep(Duration::from_secs_f64(buffer.duration_seconds() / 2.0)).await;
                Ok::<_, LiveError>(buffer)
            })
        })
    }

    fn rounded_durations(output: &VirtualOutput) -> Vec<f64> {
        output
            .started()
            .iter()
            .map(|s| (s.duration * 10.0).round() / 10.0)
            .collect()
    }

    async fn wait_for(monitor: &SessionMonitor, what: &str, check: impl Fn(&SessionStatus) -> bool) {
        for _ in 0..200 {
            if check(&monitor.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}: {:?}", what, monitor.snapshot());
    }

    fn scripted(frames: usize) -> Arc<ScriptedCapture> {
        Arc::new(ScriptedCapture {
            frames: vec![vec![0.25; 160]; frames],
            ..ScriptedCapture::default()
        })
    }

    #[tokio::test]
    async fn test_permission_denied_keeps_session_idle() {
        let (connector, _remote) = ChannelConnector::with_channel();
        let mut session = LiveSession::new(
            deps(connector.clone(), Arc::new(NoCapture), VirtualOutput::new()),
            SessionMonitor::new(),
        );

        let result = session.connect(&LiveSettings::default(), pending()).await;
        assert!(matches!(result, Err(LiveError::Permission(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_active());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (connector, _remote) = ChannelConnector::with_channel();
        let mut session = LiveSession::new(
            deps(connector, scripted(0), VirtualOutput::new()),
            SessionMonitor::new(),
        );

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Idle);

        session.connect(&LiveSettings::default(), pending()).await.unwrap();
        assert!(session.is_active());
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_open_session_routes_audio_both_ways() {
        let (connector, mut remote) = ChannelConnector::with_channel();
        let output = VirtualOutput::new();
        let capture = scripted(2);
        let monitor = SessionMonitor::new();
        let mut session = LiveSession::new(deps(connector.clone(), capture.clone(), output.clone()), monitor.clone());

        session.connect(&LiveSettings::default(), pending()).await.unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(capture.opened.load(Ordering::SeqCst), 1);
        assert!(matches!(connector.setups.lock().unwrap()[0], ClientMessage::Setup(_)));

        // Captured frames go out as realtime input
        for _ in 0..2 {
            match remote.received.recv().await.unwrap() {
                ClientMessage::RealtimeInput(input) => {
                    assert_eq!(input.media_chunks[0].mime_type, "audio/pcm;rate=16000");
                }
                other => panic!("unexpected outbound message: {:?}", other),
            }
        }

        remote
            .events
            .send(message(serde_json::json!({
                "serverContent": { "outputTranscription": { "text": "hello" } }
            })))
            .await
            .unwrap();
        for duration in [0.1, 0.2, 0.3] {
            remote.events.send(audio(duration)).await.unwrap();
        }

        wait_for(&monitor, "three scheduled chunks", |s| s.counters.chunks_scheduled == 3).await;
        assert_eq!(session.transcript(), vec!["Mind: hello".to_string()]);

        // Scheduled strictly in arrival order, back to back
        let starts = output.started();
        let durations: Vec<f64> = starts.iter().map(|s| (s.duration * 10.0).round() / 10.0).collect();
        assert_eq!(durations, vec![0.1, 0.2, 0.3]);
        assert!((starts[2].start_time - 0.3).abs() < 1e-9);

        // Interrupt stops everything still playing, session stays open
        output.advance(0.15);
        remote
            .events
            .send(message(serde_json::json!({ "serverContent": { "interrupted": true } })))
            .await
            .unwrap();
        wait_for(&monitor, "interrupt", |s| s.counters.interruptions == 1).await;
        assert_eq!(output.stopped().len(), 2);
        assert!(session.is_active());

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_bad_chunk_is_skipped_and_session_survives() {
        let (connector, remote) = ChannelConnector::with_channel();
        let output = VirtualOutput::new();
        let monitor = SessionMonitor::new();
        let mut session = LiveSession::new(deps(connector, scripted(0), output.clone()), monitor.clone());
        session.connect(&LiveSettings::default(), pending()).await.unwrap();

        remote
            .events
            .send(message(serde_json::json!({
                "serverContent": { "modelTurn": { "parts": [{ "inlineData": { "data": "%%%not base64%%%" } }] } }
            })))
            .await
            .unwrap();
        remote
            .events
            .send(TransportEvent::Malformed(LiveError::Decode("garbage".to_string())))
            .await
            .unwrap();
        remote.events.send(audio(0.1)).await.unwrap();

        wait_for(&monitor, "valid chunk after bad one", |s| s.counters.chunks_scheduled == 1).await;
        let status = monitor.snapshot();
        assert_eq!(status.counters.chunks_dropped, 1);
        assert_eq!(status.counters.malformed_messages, 1);
        assert!(session.is_active());
        assert_eq!(output.started().len(), 1);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_remote_close_tears_down() {
        let (connector, mut remote) = ChannelConnector::with_channel();
        let output = VirtualOutput::new();
        let monitor = SessionMonitor::new();
        let mut events = monitor.subscribe();
        let mut session = LiveSession::new(deps(connector, scripted(0), output.clone()), monitor.clone());
        session.connect(&LiveSettings::default(), pending()).await.unwrap();

        remote.events.send(audio(0.5)).await.unwrap();
        wait_for(&monitor, "scheduled chunk", |s| s.counters.chunks_scheduled == 1).await;

        remote
            .events
            .send(TransportEvent::Closed(Some("bye".to_string())))
            .await
            .unwrap();
        wait_for(&monitor, "closed", |s| s.state == SessionState::Closed).await;

        let status = monitor.snapshot();
        assert!(!status.is_active);
        assert!(status.close_reason.unwrap().contains("bye"));
        assert_eq!(output.playing_count(), 0);
        // Outbound side was dropped with the channel
        assert!(remote.received.recv().await.is_none());

        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            saw_closed |= matches!(event, SessionEvent::Closed { .. });
        }
        assert!(saw_closed);

        // Disconnect after a remote close is harmless
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_transport_error() {
        let mut session = LiveSession::new(
            deps(ChannelConnector::hanging(), scripted(0), VirtualOutput::new()),
            SessionMonitor::new(),
        );
        let settings = LiveSettings {
            connect_timeout: Duration::from_millis(50),
            ..LiveSettings::default()
        };

        let result = session.connect(&settings, pending()).await;
        assert!(matches!(result, Err(LiveError::Transport(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_refused_channel_closes_session() {
        let connector = Arc::new(ChannelConnector::default());
        let mut session = LiveSession::new(
            deps(connector, scripted(0), VirtualOutput::new()),
            SessionMonitor::new(),
        );

        assert!(matches!(
            session.connect(&LiveSettings::default(), pending()).await,
            Err(LiveError::Transport(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_audio_captured_while_dialing_is_not_sent() {
        let (connector, mut remote) = ChannelConnector::with_channel();
        let capture = Arc::new(ScriptedCapture {
            stale: vec![vec![0.75; 160]; 3],
            frames: vec![vec![0.25; 160]],
            ..ScriptedCapture::default()
        });
        let monitor = SessionMonitor::new();
        let mut session = LiveSession::new(deps(connector, capture, VirtualOutput::new()), monitor.clone());
        session.connect(&LiveSettings::default(), pending()).await.unwrap();

        for _ in 0..3 {
            match remote.received.recv().await.unwrap() {
                ClientMessage::RealtimeInput(input) => {
                    let frame = codec::decode_base64_pcm(&input.media_chunks[0].data, 16_000, 1).unwrap();
                    assert_eq!(frame.channel(0)[0], 0.25);
                }
                other => panic!("unexpected outbound message: {:?}", other),
            }
        }

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_cancelled_handshake_closes_session() {
        let mut session = LiveSession::new(
            deps(ChannelConnector::hanging(), scripted(0), VirtualOutput::new()),
            SessionMonitor::new(),
        );
        let settings = LiveSettings {
            connect_timeout: Duration::from_secs(30),
            ..LiveSettings::default()
        };

        let started = std::time::Instant::now();
        let result = session.connect(&settings, async {}).await;
        assert!(matches!(result, Err(LiveError::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_slow_device_open_keeps_runtime_responsive() {
        let (connector, _remote) = ChannelConnector::with_channel();
        let capture = Arc::new(ScriptedCapture {
            open_delay: Duration::from_millis(300),
            ..ScriptedCapture::default()
        });
        let mut session = LiveSession::new(deps(connector, capture, VirtualOutput::new()), SessionMonitor::new());

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        session.connect(&LiveSettings::default(), pending()).await.unwrap();
        ticker.abort();

        // The single-threaded test runtime kept running while the device opened
        let ticks = ticks.load(Ordering::SeqCst);
        assert!(ticks >= 10, "only {} ticks during a 300ms open", ticks);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_out_of_order_decodes_play_in_arrival_order() {
        let (connector, remote) = ChannelConnector::with_channel();
        let output = VirtualOutput::new();
        let monitor = SessionMonitor::new();
        let mut session = LiveSession::new(deps(connector, scripted(0), output.clone()), monitor.clone())
            .with_decoder(slow_decoder());
        session.connect(&LiveSettings::default(), pending()).await.unwrap();

        // The short second chunk finishes decoding well before the long first one
        remote.events.send(audio_turn(&[0.4, 0.1])).await.unwrap();
        wait_for(&monitor, "both chunks", |s| s.counters.chunks_scheduled == 2).await;

        let starts = output.started();
        assert_eq!(rounded_durations(&output), vec![0.4, 0.1]);
        assert_eq!(starts[0].start_time, 0.0);
        assert!((starts[1].start_time - 0.4).abs() < 1e-9);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_decode_finishing_after_interrupt_starts_at_now() {
        let (connector, remote) = ChannelConnector::with_channel();
        let output = VirtualOutput::new();
        let monitor = SessionMonitor::new();
        let mut session = LiveSession::new(deps(connector, scripted(0), output.clone()), monitor.clone())
            .with_decoder(slow_decoder());
        session.connect(&LiveSettings::default(), pending()).await.unwrap();

        remote.events.send(audio(0.5)).await.unwrap();
        wait_for(&monitor, "first chunk", |s| s.counters.chunks_scheduled == 1).await;
        output.advance(0.2);

        // Interrupt lands while the next chunk is still decoding
        remote.events.send(audio(0.4)).await.unwrap();
        remote
            .events
            .send(message(serde_json::json!({ "serverContent": { "interrupted": true } })))
            .await
            .unwrap();
        wait_for(&monitor, "interrupt", |s| s.counters.interruptions == 1).await;
        assert_eq!(monitor.snapshot().counters.chunks_scheduled, 1);

        wait_for(&monitor, "late chunk", |s| s.counters.chunks_scheduled == 2).await;
        let starts = output.started();
        assert_eq!(output.stopped(), vec![starts[0].id]);
        // Starts at the current clock, not after the chunk that was cut off
        assert!((starts[1].start_time - 0.2).abs() < 1e-9);
        assert!((starts[1].duration - 0.4).abs() < 1e-9);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_crashed_decode_releases_its_slot() {
        let (connector, remote) = ChannelConnector::with_channel();
        let output = VirtualOutput::new();
        let monitor = SessionMonitor::new();
        let decoder: ChunkDecoder = Arc::new(|data: String, sample_rate: u32| -> BoxFuture<'static, LiveResult<AudioBuffer>> {
            Box::pin(async move {
                let buffer = codec::decode_base64_pcm(&data, sample_rate, 1)?;
                if buffer.frame_count() == 4_800 {
                    panic!("decoder crashed");
                }
                Ok::<_, LiveError>(buffer)
            })
        });
        let mut session =
            LiveSession::new(deps(connector, scripted(0), output.clone()), monitor.clone()).with_decoder(decoder);
        session.connect(&LiveSettings::default(), pending()).await.unwrap();

        remote.events.send(audio_turn(&[0.2, 0.1])).await.unwrap();
        wait_for(&monitor, "chunk after the crash", |s| s.counters.chunks_scheduled == 1).await;

        assert_eq!(monitor.snapshot().counters.chunks_dropped, 1);
        assert_eq!(rounded_durations(&output), vec![0.1]);
        assert!(session.is_active());

        session.disconnect().await;
    }
}
