//! Session lifecycle controller.
//!
//! [`LiveSession::start`] acquires capture, opens the channel and spawns the
//! workers. From then on a single task owns all mutable session state
//! ([`SessionCore`]) and reacts to [`SessionEvent`]s in arrival order. Workers
//! only see a [`SessionGate`] and report back through the queue.
//!
//! Teardown always closes the gate (Draining) before stopping anything, so a
//! decode or synthesis finishing mid-teardown sees a closed gate and is dropped.

use crate::capture::{CaptureBackend, CaptureHandle, CaptureManager, CpalCaptureBackend};
use crate::channel::{
    AudioPayload, ChannelConfig, ChannelConnector, InboundEvent, InboundSink, LiveConnector,
    SessionChannel, Speaker,
};
use crate::config::SessionConfig;
use crate::decode::{decode_encoded_audio, DecodedAudio, PayloadDecoder, Pcm16Decoder};
use crate::encoder::{run_uplink, UplinkEncoder};
use crate::error::{SessionError, SessionResult};
use crate::events::{SessionCallbacks, SessionEvent, TeardownReason, TranscriptEvent};
use crate::interruption::InterruptionHandler;
use crate::output::RodioOutput;
use crate::recording::Recorder;
use crate::scheduler::{DownlinkScheduler, OutputDevice};
use crate::session::{Session, SessionGate, SessionState};
use crate::synthesis::{HttpSynthesisBackend, SynthesisBackend, VoiceParams};
use crate::vad::run_vad_loop;
use crate::voice_path::{VoicePath, VoicePathSelector};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The pluggable edges of a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub capture: Arc<dyn CaptureBackend>,
    pub connector: Arc<dyn ChannelConnector>,
    pub output: Arc<dyn OutputDevice>,
    pub decoder: Arc<dyn PayloadDecoder>,
    /// `None` disables the alternate voice path.
    pub synthesis: Option<Arc<dyn SynthesisBackend>>,
}

impl SessionDeps {
    /// Real devices: cpal microphone, rodio output, the live websocket and,
    /// when enabled, the HTTP synthesis backend.
    pub fn native(config: &SessionConfig) -> SessionResult<Self> {
        let synthesis: Option<Arc<dyn SynthesisBackend>> = if config.alternate_voice.enabled {
            Some(Arc::new(HttpSynthesisBackend::from_config(&config.alternate_voice)?))
        } else {
            None
        };
        Ok(Self {
            capture: Arc::new(CpalCaptureBackend::new()),
            connector: Arc::new(LiveConnector::new()),
            output: Arc::new(RodioOutput::new(config.playback.sample_rate)?),
            decoder: Arc::new(Pcm16Decoder),
            synthesis,
        })
    }
}

struct DecodeJob {
    generation: u64,
    payload: AudioPayload,
}

struct SynthesisJob {
    generation: u64,
    text: String,
}

type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Control surface of a running session. Cheap to clone.
///
/// Dropping the last clone tears the session down.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    events: EventSender,
    gate: SessionGate,
    speaking: watch::Receiver<bool>,
    _owner: Arc<OwnerGuard>,
}

/// Shared by every clone of a handle; requests teardown when the last one goes.
struct OwnerGuard {
    id: Uuid,
    events: EventSender,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        if self
            .events
            .send(SessionEvent::TeardownRequested(TeardownReason::HandleDropped))
            .is_ok()
        {
            debug!("Last handle to session {} dropped", self.id);
        }
    }
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.gate.state()
    }

    /// Local VAD: is the user currently speaking.
    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.speaking.clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.gate.watch()
    }

    /// Ask the session to shut down. No-op once it is closed.
    pub fn request_teardown(&self) {
        if self
            .events
            .send(SessionEvent::TeardownRequested(TeardownReason::Requested))
            .is_err()
        {
            debug!("Teardown requested for session {} after it closed", self.id);
        }
    }

    /// Choose the voice for subsequent model turns.
    pub async fn set_voice_path(&self, path: VoicePath) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::SelectVoicePath { path, reply })
            .map_err(|_| SessionError::State("session is closed".to_string()))?;
        rx.await
            .map_err(|_| SessionError::State("session closed before the request was handled".to_string()))?
    }

    pub async fn wait_closed(&self) {
        self.gate.clone().closed().await;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

pub struct LiveSession;

impl LiveSession {
    /// Bring a session up: Initializing, capture, recorder, channel, Active.
    ///
    /// Fails fast; whatever was acquired before the failure is released and
    /// the partial recording is still delivered.
    pub async fn start(
        config: SessionConfig,
        deps: SessionDeps,
        callbacks: SessionCallbacks,
    ) -> SessionResult<SessionHandle> {
        config.validate()?;
        let session = Session::new();
        info!("🚀 Starting session {}", session.id);
        callbacks.state_changed(SessionState::Initializing);

        let mut capture = match CaptureManager::acquire(deps.capture.as_ref(), &config.capture) {
            Ok(c) => c,
            Err(e) => {
                callbacks.error(&e);
                set_state(&session, &callbacks, SessionState::Closed);
                return Err(e);
            }
        };

        let mut recorder = if config.recording.enabled {
            capture.subscribe_audio().map(|audio_rx| {
                Recorder::start(
                    session.id,
                    &config.recording,
                    &config.capture,
                    audio_rx,
                    capture.subscribe_video(),
                )
            })
        } else {
            None
        };

        let alternate_available = match (&deps.synthesis, config.alternate_voice.enabled) {
            (Some(backend), true) => {
                let healthy = backend.health().await;
                if !healthy {
                    callbacks.error(&SessionError::BackendUnavailable(
                        "synthesis backend failed its health check".to_string(),
                    ));
                }
                healthy
            }
            _ => false,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let inbound_tx = events_tx.clone();
        let sink: InboundSink = Arc::new(move |event| {
            let _ = inbound_tx.send(SessionEvent::Inbound(event));
        });

        let channel = match deps.connector.open(&ChannelConfig::from(&config), sink).await {
            Ok(channel) => channel,
            Err(e) => {
                abandon_start(&session, &callbacks, None, &mut capture, recorder.take(), &e).await;
                return Err(e);
            }
        };

        let audio_for_uplink = capture.subscribe_audio();
        let audio_for_vad = capture.subscribe_audio();
        let (Some(audio_for_uplink), Some(audio_for_vad)) = (audio_for_uplink, audio_for_vad) else {
            let e = SessionError::State("capture ended before the session started".to_string());
            abandon_start(&session, &callbacks, Some(&channel), &mut capture, recorder.take(), &e).await;
            return Err(e);
        };

        set_state(&session, &callbacks, SessionState::Active);

        tokio::spawn(run_uplink(
            UplinkEncoder::new(&config.capture),
            audio_for_uplink,
            capture.subscribe_video(),
            channel.clone(),
            session.gate(),
        ));

        let (speaking_tx, speaking_rx) = watch::channel(false);
        tokio::spawn(run_vad_loop(
            config.vad.clone(),
            audio_for_vad,
            speaking_tx,
            callbacks.vad_hook(),
            session.gate(),
        ));

        let (decode_tx, decode_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_decode_worker(
            deps.decoder.clone(),
            decode_rx,
            events_tx.clone(),
            session.gate(),
        ));

        let synth_tx = match (&deps.synthesis, alternate_available) {
            (Some(backend), true) => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_synthesis_worker(
                    backend.clone(),
                    VoiceParams::from(&config.alternate_voice),
                    rx,
                    events_tx.clone(),
                    session.gate(),
                ));
                Some(tx)
            }
            _ => None,
        };

        let finished_tx = events_tx.clone();
        let scheduler = DownlinkScheduler::new(
            deps.output.clone(),
            Arc::new(move |id| {
                let _ = finished_tx.send(SessionEvent::PlaybackFinished(id));
            }),
        );

        let handle = SessionHandle {
            id: session.id,
            events: events_tx.clone(),
            gate: session.gate(),
            speaking: speaking_rx,
            _owner: Arc::new(OwnerGuard {
                id: session.id,
                events: events_tx,
            }),
        };

        let core = SessionCore {
            session,
            callbacks,
            scheduler,
            voice: VoicePathSelector::new(alternate_available),
            interruption: InterruptionHandler::new(),
            channel,
            capture,
            recorder,
            decode_tx: Some(decode_tx),
            synth_tx,
        };
        tokio::spawn(core.run(events_rx));

        info!("✅ Session {} active", handle.id);
        Ok(handle)
    }
}

fn set_state(session: &Session, callbacks: &SessionCallbacks, next: SessionState) {
    match session.transition(next) {
        Ok(previous) if previous != next => callbacks.state_changed(next),
        Ok(_) => {}
        Err(e) => warn!("{}", e),
    }
}

/// Unwind a start that failed after capture was acquired: same order as a
/// normal teardown, minus the pieces that were never started.
async fn abandon_start(
    session: &Session,
    callbacks: &SessionCallbacks,
    channel: Option<&Arc<dyn SessionChannel>>,
    capture: &mut CaptureHandle,
    recorder: Option<Recorder>,
    error: &SessionError,
) {
    callbacks.error(error);
    set_state(session, callbacks, SessionState::Draining);
    if let Some(channel) = channel {
        channel.close();
    }
    capture.release();
    if let Some(recorder) = recorder {
        finish_recording(recorder, callbacks).await;
    }
    set_state(session, callbacks, SessionState::Closed);
}

async fn finish_recording(recorder: Recorder, callbacks: &SessionCallbacks) {
    match recorder.finish().await {
        Ok(artifact) => callbacks.recording(artifact),
        Err(e) => callbacks.error(&e),
    }
}

/// Whether the loop keeps going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Teardown(TeardownReason),
}

/// All mutable session state. Lives inside the event-loop task.
struct SessionCore {
    session: Session,
    callbacks: SessionCallbacks,
    scheduler: DownlinkScheduler,
    voice: VoicePathSelector,
    interruption: InterruptionHandler,
    channel: Arc<dyn SessionChannel>,
    capture: CaptureHandle,
    recorder: Option<Recorder>,
    decode_tx: Option<mpsc::UnboundedSender<DecodeJob>>,
    synth_tx: Option<mpsc::UnboundedSender<SynthesisJob>>,
}

impl SessionCore {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let reason = loop {
            let Some(event) = events.recv().await else {
                break TeardownReason::HandleDropped;
            };
            if let Flow::Teardown(reason) = self.handle_event(event) {
                break reason;
            }
        };
        self.teardown(reason).await;
    }

    fn handle_event(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Inbound(inbound) => self.handle_inbound(inbound),
            SessionEvent::ChunkDecoded { generation, audio } => {
                self.schedule(generation, audio, "decoded chunk");
                Flow::Continue
            }
            SessionEvent::SynthesisReady { generation, audio } => {
                self.schedule(generation, audio, "synthesized turn");
                Flow::Continue
            }
            SessionEvent::DecodeFailed { generation, error } => {
                if self.interruption.is_current(generation) {
                    self.callbacks.error(&error);
                }
                Flow::Continue
            }
            SessionEvent::SynthesisFailed { generation, error } => {
                if matches!(error, SessionError::BackendUnavailable(_)) {
                    self.voice.disable_alternate();
                    self.synth_tx = None;
                } else if !self.interruption.is_current(generation) {
                    return Flow::Continue;
                }
                self.callbacks.error(&error);
                Flow::Continue
            }
            SessionEvent::PlaybackFinished(id) => {
                if self.scheduler.on_finished(id) {
                    debug!("🔈 {} finished ({} active)", id, self.scheduler.active_count());
                }
                Flow::Continue
            }
            SessionEvent::SelectVoicePath { path, reply } => {
                let result = self.voice.request(path);
                let _ = reply.send(result);
                Flow::Continue
            }
            SessionEvent::TeardownRequested(reason) => Flow::Teardown(reason),
        }
    }

    fn handle_inbound(&mut self, event: InboundEvent) -> Flow {
        match event {
            InboundEvent::AudioPart(payload) => {
                if !self.session.is_accepting_work() {
                    debug!("Dropping audio part: session is {}", self.session.state());
                    return Flow::Continue;
                }
                if !self.voice.accepts_native_audio() {
                    debug!("Dropping native audio of an alternate-voice turn");
                    return Flow::Continue;
                }
                if let Some(tx) = &self.decode_tx {
                    let _ = tx.send(DecodeJob {
                        generation: self.interruption.generation(),
                        payload,
                    });
                }
            }
            InboundEvent::TextPart(text) => {
                if self.session.is_accepting_work() {
                    self.voice.push_text(&text);
                }
                self.callbacks.transcript(TranscriptEvent::ModelText { text });
            }
            InboundEvent::Transcription { speaker, text } => {
                if speaker == Speaker::Model && self.session.is_accepting_work() {
                    self.voice.push_transcript(&text);
                }
                self.callbacks
                    .transcript(TranscriptEvent::Transcription { speaker, text });
            }
            InboundEvent::Interrupted => {
                self.interrupt();
                self.callbacks.transcript(TranscriptEvent::Interrupted);
            }
            InboundEvent::TurnComplete => {
                if let Some(text) = self.voice.finish_turn() {
                    self.request_synthesis(text);
                }
                self.callbacks.transcript(TranscriptEvent::TurnComplete);
            }
            InboundEvent::Closed => {
                self.callbacks.error(&SessionError::Connection(
                    "service closed the channel".to_string(),
                ));
                return Flow::Teardown(TeardownReason::RemoteClosed);
            }
            InboundEvent::Error(message) => {
                self.callbacks.error(&SessionError::Connection(message));
                return Flow::Teardown(TeardownReason::Fatal);
            }
        }
        Flow::Continue
    }

    fn interrupt(&mut self) {
        if self.session.state() != SessionState::Active {
            debug!("Ignoring interruption while {}", self.session.state());
            return;
        }
        self.set_state(SessionState::Interrupting);
        self.interruption.interrupt(&mut self.scheduler, &mut self.voice);
        self.set_state(SessionState::Active);
    }

    fn request_synthesis(&mut self, text: String) {
        let Some(tx) = &self.synth_tx else {
            debug!("No synthesis worker; dropping {} chars of turn text", text.len());
            return;
        };
        let job = SynthesisJob {
            generation: self.interruption.generation(),
            text,
        };
        if tx.send(job).is_err() {
            warn!("Synthesis worker is gone");
        }
    }

    /// Re-checks the gate and the interruption epoch, then schedules.
    fn schedule(&mut self, generation: u64, audio: DecodedAudio, what: &str) {
        if !self.session.is_accepting_work() {
            debug!("Dropping {}: session is {}", what, self.session.state());
            return;
        }
        if !self.interruption.is_current(generation) {
            debug!("Dropping {} from before an interruption", what);
            return;
        }
        if let Err(e) = self.scheduler.schedule(audio) {
            self.callbacks.error(&e);
        }
    }

    fn set_state(&self, next: SessionState) {
        set_state(&self.session, &self.callbacks, next);
    }

    async fn teardown(mut self, reason: TeardownReason) {
        info!("🛑 Tearing down session {} ({:?})", self.session.id, reason);
        // Gate first: every pending completion must observe it before anything stops.
        self.set_state(SessionState::Draining);

        self.scheduler.stop_all();
        self.decode_tx = None;
        self.synth_tx = None;
        self.channel.close();
        self.capture.release();
        if let Some(recorder) = self.recorder.take() {
            finish_recording(recorder, &self.callbacks).await;
        }

        self.set_state(SessionState::Closed);
        info!("👋 Session {} closed", self.session.id);
    }
}

async fn run_decode_worker(
    decoder: Arc<dyn PayloadDecoder>,
    mut jobs: mpsc::UnboundedReceiver<DecodeJob>,
    events: EventSender,
    mut gate: SessionGate,
) {
    loop {
        let job = tokio::select! {
            _ = gate.shutting_down() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if !gate.is_accepting_work() {
            continue;
        }
        let decoder = decoder.clone();
        let event = match tokio::task::spawn_blocking(move || decoder.decode(job.payload)).await {
            Ok(Ok(audio)) => SessionEvent::ChunkDecoded {
                generation: job.generation,
                audio,
            },
            Ok(Err(error)) => SessionEvent::DecodeFailed {
                generation: job.generation,
                error,
            },
            Err(e) => SessionEvent::DecodeFailed {
                generation: job.generation,
                error: SessionError::Decode(format!("decode task failed: {}", e)),
            },
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("Decode worker stopped");
}

async fn run_synthesis_worker(
    backend: Arc<dyn SynthesisBackend>,
    params: VoiceParams,
    mut jobs: mpsc::UnboundedReceiver<SynthesisJob>,
    events: EventSender,
    mut gate: SessionGate,
) {
    loop {
        let job = tokio::select! {
            _ = gate.shutting_down() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if !gate.is_accepting_work() {
            continue;
        }
        let generation = job.generation;
        let bytes = match backend.synthesize(&job.text, &params).await {
            Ok(bytes) if bytes.is_empty() => continue,
            Ok(bytes) => bytes,
            Err(error) => {
                if events.send(SessionEvent::SynthesisFailed { generation, error }).is_err() {
                    break;
                }
                continue;
            }
        };
        let event = match tokio::task::spawn_blocking(move || decode_encoded_audio(bytes)).await {
            Ok(Ok(audio)) => SessionEvent::SynthesisReady { generation, audio },
            Ok(Err(error)) => SessionEvent::SynthesisFailed { generation, error },
            Err(e) => SessionEvent::SynthesisFailed {
                generation,
                error: SessionError::Decode(format!("synthesis decode task failed: {}", e)),
            },
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("Synthesis worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DeviceStream, FrameSink, VideoSource};
    use crate::config::{CaptureConstraints, RecordingConfig};
    use crate::encoder::TransportChunk;
    use crate::error::ErrorSeverity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingMic(Arc<AtomicUsize>);

    impl DeviceStream for CountingMic {
        fn stop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MicOnly {
        stops: Arc<AtomicUsize>,
    }

    impl CaptureBackend for MicOnly {
        fn open_microphone(
            &self,
            _constraints: &CaptureConstraints,
            _sink: FrameSink,
        ) -> SessionResult<Box<dyn DeviceStream>> {
            Ok(Box::new(CountingMic(self.stops.clone())))
        }

        fn open_camera(&self, _c: &CaptureConstraints) -> SessionResult<Box<dyn VideoSource>> {
            Err(SessionError::DeviceNotFound("no camera".into()))
        }
    }

    #[derive(Default)]
    struct ClosingChannel {
        closes: AtomicUsize,
    }

    impl SessionChannel for ClosingChannel {
        fn send_media(&self, _chunk: TransportChunk) -> SessionResult<()> {
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn abandoned_start_drains_and_finalizes_recording() {
        let backend = MicOnly::default();
        let constraints = CaptureConstraints::default();
        let mut capture = CaptureManager::acquire(&backend, &constraints).unwrap();
        let session = Session::new();
        let recorder = Recorder::start(
            session.id,
            &RecordingConfig::default(),
            &constraints,
            capture.subscribe_audio().unwrap(),
            None,
        );

        let states = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let recordings = Arc::new(AtomicUsize::new(0));
        let (s, e, r) = (states.clone(), errors.clone(), recordings.clone());
        let callbacks = SessionCallbacks::new()
            .on_state_change(move |state| s.lock().unwrap().push(state))
            .on_error(move |_, severity| e.lock().unwrap().push(severity))
            .on_recording(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            });

        let fake = Arc::new(ClosingChannel::default());
        let channel: Arc<dyn SessionChannel> = fake.clone();
        let err = SessionError::State("capture ended before the session started".into());
        abandon_start(&session, &callbacks, Some(&channel), &mut capture, Some(recorder), &err).await;

        assert_eq!(
            *states.lock().unwrap(),
            vec![SessionState::Draining, SessionState::Closed]
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fake.closes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert_eq!(recordings.load(Ordering::SeqCst), 1);
        assert_eq!(*errors.lock().unwrap(), vec![ErrorSeverity::Recoverable]);
    }
}
