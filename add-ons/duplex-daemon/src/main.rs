//! Duplex Voice Daemon
//!
//! Always-listening voice assistant: wires microphone and speaker to the cloud dialogue
//! service, answers complex queries through a tool-calling agent, and reconnects with
//! backoff whenever the connection drops.

mod agent;
mod classifier;
mod console;
mod host;
mod settings;
mod tts;

use anyhow::Context;
use clap::Parser;
use duplex_voice::{
    list_input_devices, list_output_devices, AudioRig, AudioThreads, CpalInput, CpalOutput, CueSet,
    EngineContext, EngineIo, LocalMedia, NoopMedia, RunExit, ToolRegistry, TurnCoordinator,
    TurnStateCell, WakeGate, WakeWordDetector,
};
use duplex_wire::{Backoff, SessionTransport};
use settings::{DaemonConfig, DetectorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A connection that stayed up this long resets the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "duplex-daemon", version, about = "Full-duplex voice assistant daemon")]
struct Args {
    /// Config file (default: $DUPLEX_CONFIG or config/duplex.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Do not read typed queries from stdin
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[duplex-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        println!("Input devices:");
        for name in list_input_devices().context("enumerate input devices")? {
            println!("  {}", name);
        }
        println!("Output devices:");
        for name in list_output_devices().context("enumerate output devices")? {
            println!("  {}", name);
        }
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::load(),
    }
    .context("load duplex config")?;
    let engine = config.engine();

    let media: Arc<dyn LocalMedia> = Arc::new(NoopMedia);
    let tools = Arc::new(ToolRegistry::with_builtins(media.clone()));
    let ctx = EngineContext {
        config: engine.clone(),
        agent: Arc::new(agent::OpenAiAgent::new(&config.agent, tools).context("agent backend")?),
        tts: Arc::new(tts::OpenAiTts::new(&config.tts).context("TTS backend")?),
        classifier: Arc::new(classifier::KeywordClassifier::new(
            config.classifier_keywords(),
            config.classifier.long_query_words,
        )),
        media,
        observer: Arc::new(host::LogObserver),
    };

    let (io, threads) = open_audio(&config, TurnStateCell::default())?;
    let mut threads = Some(threads);
    let mut coordinator = TurnCoordinator::new(ctx, io);
    let handle = coordinator.handle();

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    {
        let stop_tx = Arc::clone(&stop_tx);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("CTRL-C received; shutting down daemon");
                    stop_tx.send_replace(true);
                }
                Err(e) => tracing::warn!(error = %e, "CTRL-C handler unavailable"),
            }
        });
    }

    if !args.no_console {
        let stop_tx = Arc::clone(&stop_tx);
        let console_handle = handle.clone();
        tokio::spawn(async move {
            if console::run(console_handle).await {
                stop_tx.send_replace(true);
            }
        });
    }

    {
        let mut stop_rx = stop_rx.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let stopped = stop_rx.wait_for(|stop| *stop).await.is_ok();
            if stopped {
                handle.shutdown().await.ok();
            }
        });
    }

    tracing::info!(
        url = %engine.cloud.connect.url,
        detector = ?config.detector.kind,
        agent_voice = ?engine.turn.agent_voice,
        "Duplex daemon started"
    );

    let result = supervise(&mut coordinator, &config, &mut threads, stop_rx).await;

    if let Some(threads) = threads {
        threads.stop();
    }
    tracing::info!("Duplex daemon stopped");
    result
}

/// Open the configured devices and spawn the capture and playback threads.
fn open_audio(config: &DaemonConfig, state: TurnStateCell) -> anyhow::Result<(EngineIo, AudioThreads)> {
    let engine = config.engine();
    let rig = AudioRig::start(
        &engine,
        state,
        CpalInput::factory(engine.audio.capture_rate),
        CpalOutput::factory(engine.audio.playback_rate, engine.audio.playback_channels),
    )
    .context("start audio devices")?;

    let detector: Box<dyn WakeWordDetector> = match config.detector.kind {
        DetectorKind::Loudness => Box::new(host::LoudnessDetector::new(config.detector.sustain_windows)),
        DetectorKind::Disabled => Box::new(host::DisabledDetector),
    };
    Ok(rig.into_io(WakeGate::new(detector, &engine.wake), CueSet::load(&engine.audio)))
}

/// Keep a connection up until asked to stop. Connection losses back off per the reconnect
/// policy; a dead audio device is reopened before the next connection.
async fn supervise(
    coordinator: &mut TurnCoordinator,
    config: &DaemonConfig,
    threads: &mut Option<AudioThreads>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let cloud = &config.cloud;
    let mut backoff = Backoff::new(config.reconnect.clone());

    loop {
        if *stop.borrow() {
            return Ok(());
        }
        let started = Instant::now();

        if threads.is_none() {
            match open_audio(config, coordinator.state_cell()) {
                Ok((io, fresh)) => {
                    tracing::info!("🎙️ Audio devices reopened");
                    coordinator.replace_audio(io);
                    *threads = Some(fresh);
                }
                Err(e) => tracing::warn!(error = %format!("{:#}", e), "Audio devices unavailable"),
            }
        }

        if threads.is_some() {
            let connected = tokio::select! {
                connected = SessionTransport::connect(&cloud.connect, cloud.transport()) => connected,
                _ = stop.wait_for(|stop| *stop) => return Ok(()),
            };

            match connected {
                Ok(transport) => {
                    tracing::info!(url = %cloud.connect.url, "🔗 Connected to dialogue service");
                    match coordinator.run(transport).await {
                        Ok(RunExit::Shutdown) => return Ok(()),
                        Err(e) if e.is_device_failure() => {
                            tracing::error!(error = %e, "Audio device lost, restarting audio");
                            if let Some(dead) = threads.take() {
                                dead.stop();
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Dialogue connection ended"),
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Connect failed"),
            }
        }

        if started.elapsed() >= STABLE_CONNECTION {
            backoff.reset();
        }
        let Some(delay) = backoff.next_delay() else {
            anyhow::bail!("giving up after {} reconnect attempts", backoff.attempt());
        };
        tracing::info!(
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.wait_for(|stop| *stop) => return Ok(()),
        }
    }
}
