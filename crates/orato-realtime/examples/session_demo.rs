//! Session Demo — connect, talk over text, watch the turn machine.
//!
//! Reads `OPENAI_API_KEY` (and optionally `REALTIME_API_URL`,
//! `REALTIME_VOICE`, `REALTIME_INSTRUCTIONS`) from the environment or `.env`.
//! Type a line to send it as a user utterance; type `!` to barge in while
//! the assistant is speaking; Ctrl+C (or `quit`) to leave.

use orato_realtime::{
    CpalSink, NoopHooks, PlaceholderToolExecutor, RealtimeSession, SessionConfig, SessionEvent,
    DisconnectKind,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = SessionConfig::from_env()?;
    info!("connecting to {}", config.url);

    let sink = Arc::new(CpalSink::new(config.playback.sample_rate)?);
    let (session, mut events) = RealtimeSession::connect(
        config,
        Box::new(NoopHooks),
        Arc::new(PlaceholderToolExecutor),
        sink,
    )
    .await?;
    info!("session ready; type to talk, `!` to interrupt, `quit` to leave");

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::AssistantTranscriptDelta { text, .. } => print!("{}", text),
                SessionEvent::TurnChanged(t) => info!("turn: {:?} -> {:?}", t.from, t.to),
                SessionEvent::UserTranscript { transcript, .. } => {
                    info!("you said: {}", transcript)
                }
                SessionEvent::Disconnected { reason } => {
                    info!("disconnected: {}", reason);
                    break;
                }
                other => info!("{:?}", other),
            }
        }
    });

    let stdin = std::io::stdin();
    loop {
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        match line {
            "" => continue,
            "quit" => break,
            "!" => session.interrupt(),
            text => session.send_user_text(text)?,
        }
    }

    session.shutdown(DisconnectKind::UserDisconnect).await;
    printer.abort();
    Ok(())
}
