//! The bidirectional session channel.
//!
//! [`LiveConnector`] speaks the live protocol over a websocket on a dedicated
//! thread: it drains the outbound queue, polls the socket with a short read
//! timeout, and hands every inbound event to the [`InboundSink`] in the
//! order the server sent them.

use crate::config::{LiveConfig, ResponseModality, SessionConfig};
use crate::encoder::TransportChunk;
use crate::error::{SessionError, SessionResult};
use crate::protocol;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use tungstenite::{Message, WebSocket};

/// Socket poll granularity; bounds how long an outbound chunk may wait.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long a locally closed channel waits for the server's close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Who a transcription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadData {
    Base64(String),
    Bytes(Vec<u8>),
}

/// Encoded audio as received from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub mime_type: String,
    pub data: PayloadData,
}

impl AudioPayload {
    pub fn base64(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: PayloadData::Base64(data.into()),
        }
    }

    pub fn bytes(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: PayloadData::Bytes(data),
        }
    }

    /// Raw payload bytes; base64 is decoded here.
    pub fn into_bytes(self) -> SessionResult<Vec<u8>> {
        match self.data {
            PayloadData::Bytes(b) => Ok(b),
            PayloadData::Base64(s) => Ok(general_purpose::STANDARD.decode(s.trim())?),
        }
    }
}

/// Events delivered by the channel, one per sink invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TextPart(String),
    AudioPart(AudioPayload),
    Transcription { speaker: Speaker, text: String },
    /// The service stopped generating because the user barged in.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The remote side closed the channel.
    Closed,
    Error(String),
}

pub type InboundSink = Arc<dyn Fn(InboundEvent) + Send + Sync>;

/// What the service needs to know when the channel opens.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub persona_instruction: String,
    pub response_modality: ResponseModality,
    pub voice: String,
    pub live: LiveConfig,
}

impl From<&SessionConfig> for ChannelConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            persona_instruction: config.persona_instruction.clone(),
            response_modality: config.response_modality,
            voice: config.voice.clone(),
            live: config.live.clone(),
        }
    }
}

/// An open channel. `send_media` is fire-and-forget; `close` is idempotent
/// and never fails.
pub trait SessionChannel: Send + Sync {
    fn send_media(&self, chunk: TransportChunk) -> SessionResult<()>;
    fn close(&self);
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(
        &self,
        config: &ChannelConfig,
        sink: InboundSink,
    ) -> SessionResult<Arc<dyn SessionChannel>>;
}

/// Connects to the live websocket endpoint.
#[derive(Debug, Default, Clone)]
pub struct LiveConnector;

impl LiveConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelConnector for LiveConnector {
    async fn open(
        &self,
        config: &ChannelConfig,
        sink: InboundSink,
    ) -> SessionResult<Arc<dyn SessionChannel>> {
        let url = config.live.url()?;
        let setup = serde_json::to_string(&protocol::setup_message(
            &config.live.model,
            &config.persona_instruction,
            &config.voice,
            config.response_modality,
            config.live.transcription,
        ))?;
        let connect_timeout = config.live.connect_timeout();
        let setup_timeout = config.live.setup_timeout();

        info!("🌐 Opening live channel (model: {}, voice: {})", config.live.model, config.voice);

        let (out_tx, out_rx) = std_mpsc::channel::<Outbound>();
        let (ready_tx, ready_rx) = oneshot::channel::<SessionResult<()>>();
        let closing = Arc::new(AtomicBool::new(false));
        let thread_closing = closing.clone();

        thread::Builder::new()
            .name("duplex-live".to_string())
            .spawn(move || {
                let worker = SocketWorker {
                    out_rx,
                    sink,
                    closing: thread_closing,
                };
                worker.run(&url, &setup, connect_timeout, setup_timeout, ready_tx);
            })?;

        let overall = connect_timeout + setup_timeout + Duration::from_secs(1);
        match tokio::time::timeout(overall, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("✅ Live channel open");
                Ok(Arc::new(LiveChannel {
                    outbound: Mutex::new(Some(out_tx)),
                    closing,
                }))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(SessionError::Connection(
                "channel thread exited during handshake".to_string(),
            )),
            Err(_) => {
                // Dropping out_tx tells the worker to give up once it surfaces.
                closing.store(true, Ordering::SeqCst);
                Err(SessionError::Connection("timed out opening live channel".to_string()))
            }
        }
    }
}

enum Outbound {
    Text(String),
    Close,
}

/// Handle to the websocket thread.
pub struct LiveChannel {
    outbound: Mutex<Option<std_mpsc::Sender<Outbound>>>,
    closing: Arc<AtomicBool>,
}

impl SessionChannel for LiveChannel {
    fn send_media(&self, chunk: TransportChunk) -> SessionResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(SessionError::ChannelSend("channel is closed".to_string()));
        }
        let text = protocol::realtime_input(&chunk)?;
        let guard = self
            .outbound
            .lock()
            .map_err(|_| SessionError::ChannelSend("outbound lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(tx) => tx
                .send(Outbound::Text(text))
                .map_err(|_| SessionError::ChannelSend("channel thread has exited".to_string())),
            None => Err(SessionError::ChannelSend("channel is closed".to_string())),
        }
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.outbound.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(Outbound::Close);
            }
        }
        info!("🔌 Live channel closing");
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct SocketWorker {
    out_rx: std_mpsc::Receiver<Outbound>,
    sink: InboundSink,
    closing: Arc<AtomicBool>,
}

impl SocketWorker {
    fn run(
        self,
        url: &str,
        setup: &str,
        connect_timeout: Duration,
        setup_timeout: Duration,
        ready_tx: oneshot::Sender<SessionResult<()>>,
    ) {
        let parsed = match url::Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
        };
        let tcp = match connect_tcp(&parsed, connect_timeout) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        // Shares the socket; used to shorten the read timeout after the handshake.
        let control = match tcp.try_clone() {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
        };
        if parsed.scheme() == "wss" {
            let host = parsed.host_str().unwrap_or_default().to_string();
            let tls = native_tls::TlsConnector::new()
                .map_err(SessionError::from)
                .and_then(|c| {
                    c.connect(&host, tcp)
                        .map_err(|e| SessionError::Connection(format!("TLS handshake failed: {}", e)))
                });
            match tls {
                Ok(stream) => {
                    self.handshake_and_pump(url, stream, control, setup, setup_timeout, ready_tx)
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        } else {
            self.handshake_and_pump(url, tcp, control, setup, setup_timeout, ready_tx);
        }
    }

    fn handshake_and_pump<S: Read + Write>(
        self,
        url: &str,
        stream: S,
        control: TcpStream,
        setup: &str,
        setup_timeout: Duration,
        ready_tx: oneshot::Sender<SessionResult<()>>,
    ) {
        let mut socket = match tungstenite::client::client(url, stream) {
            Ok((socket, _response)) => socket,
            Err(e) => {
                let _ = ready_tx.send(Err(SessionError::Connection(format!(
                    "websocket handshake failed: {}",
                    e
                ))));
                return;
            }
        };

        if let Err(e) = control.set_read_timeout(Some(POLL_INTERVAL)) {
            let _ = ready_tx.send(Err(e.into()));
            return;
        }

        if let Err(e) = socket.send(Message::text(setup.to_string())) {
            let _ = ready_tx.send(Err(e.into()));
            return;
        }
        debug!("Setup message sent");

        if let Err(e) = await_setup_complete(&mut socket, setup_timeout) {
            let _ = socket.close(None);
            let _ = ready_tx.send(Err(e));
            return;
        }
        if ready_tx.send(Ok(())).is_err() || self.closing.load(Ordering::SeqCst) {
            // Opener gave up while we were handshaking.
            let _ = socket.close(None);
            let _ = socket.flush();
            return;
        }

        self.pump(socket);
    }

    fn pump<S: Read + Write>(self, mut socket: WebSocket<S>) {
        let mut local_close = false;
        let mut close_started: Option<Instant> = None;
        loop {
            if close_started.is_some_and(|t| t.elapsed() > CLOSE_GRACE) {
                debug!("Server did not acknowledge close; dropping socket");
                return;
            }
            loop {
                match self.out_rx.try_recv() {
                    Ok(Outbound::Text(text)) => {
                        if let Err(e) = socket.send(Message::text(text)) {
                            if !local_close {
                                self.emit(InboundEvent::Error(e.to_string()));
                            }
                            return;
                        }
                    }
                    Ok(Outbound::Close) | Err(std_mpsc::TryRecvError::Disconnected) => {
                        if !local_close {
                            local_close = true;
                            close_started = Some(Instant::now());
                            let _ = socket.close(None);
                            let _ = socket.flush();
                        }
                        break;
                    }
                    Err(std_mpsc::TryRecvError::Empty) => break,
                }
            }

            match socket.read() {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => match msg.to_text() {
                    Ok(raw) => self.dispatch(raw),
                    Err(e) => warn!("Non-UTF8 frame from server: {}", e),
                },
                Ok(Message::Close(frame)) => {
                    if !local_close {
                        info!("Live channel closed by server: {:?}", frame);
                        self.emit(InboundEvent::Closed);
                    }
                    return;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    if !local_close {
                        self.emit(InboundEvent::Closed);
                    }
                    return;
                }
                Err(e) => {
                    if !local_close {
                        error!("Live channel error: {}", e);
                        self.emit(InboundEvent::Error(e.to_string()));
                    }
                    return;
                }
            }
        }
    }

    fn dispatch(&self, raw: &str) {
        match protocol::parse_server_message(raw) {
            Ok(parsed) => {
                if let Some(time_left) = parsed.go_away {
                    warn!("Server will close the channel soon (time left: {})", time_left);
                }
                for event in parsed.events {
                    self.emit(event);
                }
            }
            Err(e) => warn!("Unparseable server message: {}", e),
        }
    }

    fn emit(&self, event: InboundEvent) {
        (self.sink)(event);
    }
}

fn connect_tcp(url: &url::Url, timeout: Duration) -> SessionResult<TcpStream> {
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::Config("endpoint has no host".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| SessionError::Config("endpoint has no port".to_string()))?;
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| SessionError::Connection(format!("failed to resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| SessionError::Connection(format!("failed to resolve {}", host)))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| SessionError::Connection(format!("connect to {} failed: {}", addr, e)))?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(Duration::from_secs(10)))?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

fn await_setup_complete<S: Read + Write>(
    socket: &mut WebSocket<S>,
    timeout: Duration,
) -> SessionResult<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match socket.read() {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                let raw = msg.to_text()?;
                if protocol::parse_server_message(raw)
                    .map(|p| p.setup_complete)
                    .unwrap_or(false)
                {
                    return Ok(());
                }
            }
            Ok(Message::Close(frame)) => {
                return Err(SessionError::Connection(format!(
                    "server closed during setup: {:?}",
                    frame
                )))
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }
    Err(SessionError::Connection("timed out waiting for setupComplete".to_string()))
}
