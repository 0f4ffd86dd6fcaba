//! CLI binary for colloquy.

use clap::{Parser, Subcommand};
use colloquy::audio::{CpalCapture, CpalSpeaker};
use colloquy::llm::{OllamaChat, build_backend};
use colloquy::pipeline::VoiceCapture;
use colloquy::rag::embedding::build_embedder;
use colloquy::rag::{KnowledgeBase, VectorIndex};
use colloquy::session::InMemoryHistory;
use colloquy::stt::HttpTranscriber;
use colloquy::tts::{HttpSynthesizer, Speaker};
use colloquy::{ChatConfig, RuntimeEvent, SessionHandle, SessionOrchestrator};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Audio chunks buffered between capture and VAD.
const AUDIO_CHANNEL_SIZE: usize = 64;
const VOICE_CHANNEL_SIZE: usize = 8;

/// Colloquy: talk to a local model about your own documents.
#[derive(Parser)]
#[command(name = "colloquy", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to a daily-rolling file in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a conversation (type at the prompt; `/stop` interrupts, `/quit` exits).
    Chat {
        /// Documents to ingest before the session starts.
        #[arg(short, long = "doc")]
        docs: Vec<PathBuf>,

        /// Load the index from this file if it exists and save it after ingestion.
        #[arg(long)]
        index: Option<PathBuf>,

        /// Talk through the microphone and hear replies.
        #[arg(long)]
        voice: bool,
    },

    /// List available audio devices.
    Devices,

    /// List models installed on the Ollama server.
    Models,

    /// Write a default configuration file.
    InitConfig {
        /// Destination (defaults to the platform config directory).
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Chat {
        docs: Vec::new(),
        index: None,
        voice: false,
    }) {
        Command::Chat { docs, index, voice } => run_chat(config, docs, index, voice).await,
        Command::Devices => list_devices(),
        Command::Models => list_models(&config).await,
        Command::InitConfig { path } => init_config(path),
    }
}

/// Stderr logging, plus a non-blocking file writer when `log_dir` is set.
/// The returned guard flushes the file on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("colloquy=info,reqwest=warn,hyper=warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "colloquy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ChatConfig> {
    let config = match path {
        Some(path) => ChatConfig::from_file(path)?,
        None => {
            let default = ChatConfig::default_config_path();
            if default.exists() {
                info!("using config {}", default.display());
                ChatConfig::from_file(&default)?
            } else {
                ChatConfig::default()
            }
        }
    };
    config.validate()?;
    Ok(config)
}

async fn run_chat(
    config: ChatConfig,
    docs: Vec<PathBuf>,
    index_path: Option<PathBuf>,
    voice: bool,
) -> anyhow::Result<()> {
    println!("colloquy v{}", env!("CARGO_PKG_VERSION"));

    let embedder = build_embedder(&config.embedding)?;
    let index = match &index_path {
        Some(path) if path.exists() => {
            VectorIndex::load_from_file(path, config.rag.max_fragments)?
        }
        _ => VectorIndex::new(config.rag.max_fragments),
    };
    let knowledge = Arc::new(KnowledgeBase::with_index(
        config.rag.clone(),
        embedder,
        Arc::new(index),
    )?);

    for doc in &docs {
        match knowledge.ingest_file(doc).await {
            Ok(report) => println!(
                "ingested {} ({} fragments)",
                report.document_id, report.fragments
            ),
            Err(e) => eprintln!("could not ingest {}: {e}", doc.display()),
        }
    }
    if let Some(path) = &index_path {
        knowledge.index().save_to_file(path)?;
    }

    let backend = build_backend(&config.llm)?;
    let history = Arc::new(InMemoryHistory::new());
    let mut orchestrator =
        SessionOrchestrator::new(config.clone(), Arc::clone(&knowledge), backend, history);
    if voice {
        let transcriber = Arc::new(HttpTranscriber::new(&config.stt)?);
        let speaker = Speaker::new(
            Arc::new(HttpSynthesizer::new(&config.tts)?),
            Arc::new(CpalSpeaker::new(&config.audio)),
        );
        orchestrator = orchestrator
            .with_transcriber(transcriber)
            .with_speaker(speaker);
    }

    let (handle, session_task) = orchestrator.start();
    let printer = tokio::spawn(print_events(handle.subscribe()));

    let cancel = CancellationToken::new();
    if voice {
        start_voice(&config, &handle, cancel.clone());
        println!("Listening. Speak, or type a message.");
    }
    println!("Type a message. /stop interrupts, /quit exits.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/stop" => handle.interrupt()?,
            text => handle.submit_text(text)?,
        }
    }

    cancel.cancel();
    handle.close();
    session_task.await?;
    printer.abort();
    Ok(())
}

/// Microphone → VAD → session.
fn start_voice(config: &ChatConfig, handle: &SessionHandle, cancel: CancellationToken) {
    let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_SIZE);
    let (voice_tx, voice_rx) = mpsc::channel(VOICE_CHANNEL_SIZE);

    let capture = CpalCapture::new(&config.audio).spawn(audio_tx, cancel.clone());
    tokio::spawn(async move {
        match capture.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("audio capture failed: {e}"),
            Err(e) => warn!("audio capture task panicked: {e}"),
        }
    });

    let stage = VoiceCapture::new(&config.vad, &config.barge_in, config.audio.input_sample_rate)
        .with_playback_flag(handle.assistant_speaking());
    tokio::spawn(async move {
        let outcome = stage.run(audio_rx, voice_tx, cancel).await;
        info!("voice capture ended: {}", outcome.label());
    });
    handle.forward_voice(voice_rx);
}

async fn print_events(mut rx: broadcast::Receiver<RuntimeEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("display lagged, skipped {n} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            RuntimeEvent::Transcript { text, .. } => println!("you> {text}"),
            RuntimeEvent::Citations { fragments, .. } => {
                let sources: Vec<String> = fragments
                    .iter()
                    .map(|f| format!("{} ({:.2})", f.fragment.id, f.score))
                    .collect();
                println!("[context: {}]", sources.join(", "));
            }
            RuntimeEvent::Token { text, .. } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            RuntimeEvent::GenerationFinished { stats, .. } => {
                println!();
                info!("{}", stats.summary());
            }
            RuntimeEvent::Cancelled { phase, .. } => println!("\n[interrupted while {phase}]"),
            RuntimeEvent::Error { message, .. } => eprintln!("\nerror: {message}"),
            RuntimeEvent::PhaseChanged { .. }
            | RuntimeEvent::TurnFinalized(_)
            | RuntimeEvent::WorkerFinished { .. } => {}
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalSpeaker::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}

async fn list_models(config: &ChatConfig) -> anyhow::Result<()> {
    let ollama = OllamaChat::new(&config.llm)?;
    for model in ollama.list_models().await? {
        let size_gb = model.size as f64 / 1e9;
        println!(
            "{:<40} {:>6.1} GB  {} {}",
            model.name, size_gb, model.details.parameter_size, model.details.quantization_level
        );
    }
    Ok(())
}

fn init_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(ChatConfig::default_config_path);
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    ChatConfig::default().save_to_file(&path)?;
    println!("wrote {}", path.display());
    Ok(())
}
