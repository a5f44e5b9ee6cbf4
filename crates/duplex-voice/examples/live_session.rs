//! Live Session Demo: talk to the live service from the default microphone.
//!
//! Config comes from an optional TOML file (first argument) overlaid with the
//! environment (`.env` is loaded). At minimum set `GEMINI_API_KEY`.
//!
//! While running, type on stdin:
//! - `alt`    speak replies with the local synthesis backend
//! - `native` speak replies with the service's own voice
//! - `quit`   end the session (Ctrl+C works too)

use anyhow::Context;
use duplex_voice::{
    LiveSession, SessionCallbacks, SessionConfig, SessionDeps, TranscriptEvent, VoicePath,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => SessionConfig::default(),
    };
    config.apply_env();

    info!("Live Session Demo. Speak any time; talking over the reply interrupts it.");
    info!("Type `alt`, `native` or `quit` and press Enter.\n");

    let callbacks = SessionCallbacks::new()
        .on_state_change(|state| info!("state: {}", state))
        .on_transcript_event(|event| match event {
            TranscriptEvent::ModelText { text } => info!("model: {}", text),
            TranscriptEvent::Transcription { speaker, text } => info!("{:?} said: {}", speaker, text),
            TranscriptEvent::Interrupted => info!("(interrupted)"),
            TranscriptEvent::TurnComplete => {}
        })
        .on_vad_change(|speaking| info!("{}", if speaking { "🎙️ speaking" } else { "🤫 quiet" }))
        .on_error(|err, severity| {
            warn!("{:?}: {}", severity, err);
            if let Some(hint) = err.remediation_hint() {
                warn!("hint: {}", hint);
            }
        })
        .on_recording(|artifact| {
            match serde_json::to_string_pretty(&artifact.metadata) {
                Ok(json) => info!("recording:\n{}", json),
                Err(e) => warn!("recording metadata: {}", e),
            }
        });

    let deps = SessionDeps::native(&config).context("opening audio devices")?;
    let session = LiveSession::start(config, deps, callbacks)
        .await
        .context("starting session")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = session.wait_closed() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let result = match line.trim() {
                    "alt" => session.set_voice_path(VoicePath::Alternate).await,
                    "native" => session.set_voice_path(VoicePath::Native).await,
                    "quit" => break,
                    "" => Ok(()),
                    other => {
                        warn!("unknown command: {}", other);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!("{}", e);
                }
            }
        }
    }

    session.request_teardown();
    session.wait_closed().await;
    info!("👋 Bye");
    Ok(())
}
