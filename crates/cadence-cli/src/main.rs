//! cadence CLI — streaming speech server and pipeline runner.
//!
//! ```text
//! cadence serve [--port 2011] [--host 127.0.0.1] [--config cadence.json]
//! cadence listen http://localhost:8000/analyze [--body '{"id": 1}']
//! cadence speak "hello world" [--server http://localhost:2011]
//! cadence stop / flush / status / voices [--server ...]
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadence_core::event::Progress;
use cadence_core::types::SpeechConfig;
use cadence_lib::pipeline::{Completion, MessageSink, PipelineHandle, PipelineOutcome};
use cadence_lib::tts::SpeechEngine;

const DEFAULT_SERVER: &str = "http://localhost:2011";

/// cadence — speak streamed text as it arrives
#[derive(Parser)]
#[command(name = "cadence", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the speech server
    Serve {
        /// Listen port
        #[arg(long, default_value = "2011")]
        port: u16,
        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[command(flatten)]
        speech: SpeechArgs,
    },
    /// Stream an analysis from an SSE backend, printing and speaking it
    Listen {
        /// Event stream URL (POSTed to)
        url: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        #[command(flatten)]
        speech: SpeechArgs,
    },
    /// Send text to the running server for speech
    Speak {
        /// Text to speak
        text: String,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Stop all speech
    Stop {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Speak whatever text is still pending
    Flush {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Get server status
    Status {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// List the synthesis voices
    Voices {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[derive(Args)]
struct SpeechArgs {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Kokoro TTS server URL
    #[arg(long)]
    kokoro_url: Option<String>,
    /// Token gap (ms) after which the stream counts as paused
    #[arg(long)]
    pause_ms: Option<u64>,
    /// Speech rate
    #[arg(long)]
    rate: Option<f32>,
    /// Playback volume
    #[arg(long)]
    volume: Option<f32>,
}

impl SpeechArgs {
    /// Config file (or defaults) with flag overrides applied.
    fn load(self) -> anyhow::Result<SpeechConfig> {
        let mut config = match &self.config {
            Some(path) => SpeechConfig::from_json_file(path).map_err(anyhow::Error::msg)?,
            None => SpeechConfig::default(),
        };
        if let Some(url) = self.kokoro_url {
            config.kokoro_url = url;
        }
        if let Some(ms) = self.pause_ms {
            config.pause_threshold_ms = ms;
        }
        if let Some(rate) = self.rate {
            config.rate = rate;
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cadence_lib=info,cadence_cli=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port, host, speech } => {
            let config = speech.load()?;
            let engine = SpeechEngine::new(&config);
            let app = cadence_lib::server::router(engine);

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!("cadence listening on {addr}");

            axum::serve(listener, app).await.context("server error")?;
        }

        Command::Listen { url, body, speech } => {
            let config = speech.load()?;
            let body: Value = match body {
                Some(raw) => serde_json::from_str(&raw).context("--body is not valid JSON")?,
                None => serde_json::json!({}),
            };
            listen(url, body, &config).await?;
        }

        Command::Speak { text, server } => {
            let resp = reqwest::Client::new()
                .post(format!("{server}/speak"))
                .json(&serde_json::json!({ "text": text }))
                .send()
                .await
                .context("request failed")?;
            println!("{}", resp.text().await.unwrap_or_default());
        }

        Command::Stop { server } => post_simple(&server, "stop").await?,
        Command::Flush { server } => post_simple(&server, "stream/end").await?,
        Command::Status { server } => get_simple(&server, "status").await?,
        Command::Voices { server } => get_simple(&server, "voices").await?,
    }

    Ok(())
}

/// Run one pipeline against `url` with a local speech engine. Ctrl-C cancels
/// the stream and silences speech.
async fn listen(url: String, body: Value, config: &SpeechConfig) -> anyhow::Result<()> {
    let speech = SpeechEngine::new(config);
    let handle = PipelineHandle::connect(
        reqwest::Client::new(),
        url,
        body,
        StdoutSink,
        speech.clone(),
    );

    let canceller = handle.canceller();

    // Dropping the join future drops the handle, which cancels the pipeline.
    let outcome = tokio::select! {
        outcome = handle.join() => outcome,
        _ = tokio::signal::ctrl_c() => PipelineOutcome::Cancelled,
    };

    match outcome {
        PipelineOutcome::Completed { .. } | PipelineOutcome::Ended => {
            tokio::select! {
                _ = speech.wait_idle() => {}
                _ = tokio::signal::ctrl_c() => {
                    canceller.cancel();
                    speech.sync().await;
                }
            }
            Ok(())
        }
        PipelineOutcome::Cancelled => {
            info!("cancelled");
            speech.sync().await;
            Ok(())
        }
        PipelineOutcome::Failed(e) => Err(e.into()),
    }
}

/// Prints tokens as they stream; progress and errors go to stderr.
struct StdoutSink;

impl MessageSink for StdoutSink {
    fn on_progress(&mut self, progress: &Progress) {
        match progress.image {
            Some(image) => eprintln!("[{} {image}/{}]", progress.step, progress.total_images),
            None => eprintln!("[{}]", progress.step),
        }
    }

    fn on_token(&mut self, token: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(token.as_bytes());
        let _ = out.flush();
    }

    fn on_complete(&mut self, completion: &Completion) {
        println!();
        if let Some(id) = &completion.message_id {
            info!("message {id} complete");
        }
        if let Some(hypothesis) = &completion.hypothesis {
            eprintln!("hypothesis: {hypothesis}");
        }
    }

    fn on_error(&mut self, message: &str) {
        eprintln!("\nerror: {message}");
    }
}

async fn post_simple(server: &str, endpoint: &str) -> anyhow::Result<()> {
    let resp = reqwest::Client::new()
        .post(format!("{server}/{endpoint}"))
        .send()
        .await
        .context("request failed")?;
    println!("{}", resp.text().await.unwrap_or_default());
    Ok(())
}

async fn get_simple(server: &str, endpoint: &str) -> anyhow::Result<()> {
    let resp = reqwest::Client::new()
        .get(format!("{server}/{endpoint}"))
        .send()
        .await
        .context("request failed")?;
    println!("{}", resp.text().await.unwrap_or_default());
    Ok(())
}
