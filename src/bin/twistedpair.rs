#![forbid(unsafe_code)]

use std::io::{self, Read, Write};
use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use twistedpair::config::Settings;
use twistedpair::ensemble::{self, Capture, RunRecord};
use twistedpair::types::{Knobs, Mode, Signal, Tone, GAIN_MAX, GAIN_MIN};
use twistedpair::web::{detect_web_search_intent, parse_web_intent};
use twistedpair::{Agent, DEFAULT_MODEL};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "twistedpair", version, about = "Signal distortion pedal for local LLMs")]
struct Cli {
    /// JSON settings file (falls back to $TWISTEDPAIR_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List modes, tones, the gain range and the default ensemble
    Knobs,
    /// List configured models
    Models,
    /// Run a signal through an ensemble of knob settings
    ///
    /// Without --tone/--gain the six-voice default ensemble is used; with both,
    /// every mode runs under that tone and gain.
    Distort {
        #[command(flatten)]
        input: SignalInput,

        #[arg(long, requires = "gain")]
        tone: Option<String>,

        #[arg(long, requires = "tone")]
        gain: Option<i64>,

        #[command(flatten)]
        run: RunOptions,
    },
    /// Run a signal through one knob setting
    Manual {
        #[command(flatten)]
        input: SignalInput,

        #[command(flatten)]
        knobs: KnobArgs,

        #[command(flatten)]
        run: RunOptions,
    },
    /// Report whether text asks for a web search, and the extracted query
    Intent {
        /// Text to inspect (stdin if omitted)
        text: Option<String>,
    },
    /// Search the web (Brave, falling back to DuckDuckGo)
    Search {
        query: String,

        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Fetch one page and extract its readable text
    Fetch {
        url: String,

        #[arg(long)]
        max_chars: Option<usize>,
    },
    /// Enrich a signal with web results when it carries a search intent
    Enrich {
        #[command(flatten)]
        input: SignalInput,
    },
    /// Multi-turn chat sessions
    Chat {
        #[command(subcommand)]
        command: ChatCommands,
    },
}

#[derive(Subcommand)]
enum ChatCommands {
    /// Create a session, optionally with an opening message
    New {
        #[command(flatten)]
        knobs: KnobArgs,

        #[arg(long)]
        model: Option<String>,

        /// Signal this conversation grew out of
        #[arg(long)]
        parent: Option<String>,

        #[arg(long)]
        message: Option<String>,
    },
    /// Send a follow-up message to a session
    Say { session_id: String, message: String },
    /// Print a session with its full history
    Show { session_id: String },
    /// Copy a session's history into a new session with different knobs
    Fork {
        session_id: String,

        #[command(flatten)]
        knobs: KnobArgs,
    },
    /// Delete a session
    Delete { session_id: String },
    /// Remove every idle-expired session
    Cleanup,
}

#[derive(Args)]
struct SignalInput {
    /// Signal text (stdin if omitted)
    text: Option<String>,

    #[arg(long)]
    source: Option<String>,

    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Args)]
struct KnobArgs {
    #[arg(long)]
    mode: String,

    #[arg(long)]
    tone: String,

    #[arg(long)]
    gain: i64,
}

#[derive(Args)]
struct RunOptions {
    #[arg(long)]
    model: Option<String>,

    /// Enrich the signal with web results before distortion
    #[arg(long)]
    web: bool,

    /// Do not append the run to the archive
    #[arg(long)]
    no_archive: bool,
}

impl KnobArgs {
    fn knobs(&self) -> CliResult<Knobs> {
        Ok(Knobs::parse(&self.mode, &self.tone, self.gain)?)
    }
}

impl SignalInput {
    fn signal(self) -> CliResult<Signal> {
        let text = text_or_stdin(self.text)?;
        Ok(ensemble::normalize_capture(Capture {
            source: self.source,
            tags: self.tags,
            ..Capture::from_text(text)
        }))
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("twistedpair=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Knobs => {
            print_json(&serde_json::json!({
                "modes": Mode::ALL.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
                "tones": Tone::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
                "gain": { "min": GAIN_MIN, "max": GAIN_MAX },
                "default_knob_sets": ensemble::default_knob_sets()
                    .iter()
                    .map(Knobs::to_json)
                    .collect::<Vec<_>>(),
            }))?;
        }
        Commands::Models => {
            print_json(&serde_json::json!({
                "default": settings.default_model,
                "available": settings.available_models,
                "fallback": DEFAULT_MODEL,
            }))?;
        }
        Commands::Distort {
            input,
            tone,
            gain,
            run,
        } => {
            let knob_sets = match (tone, gain) {
                (Some(tone), Some(gain)) => {
                    let gain = u8::try_from(gain)
                        .map_err(|_| format!("gain {gain} out of range"))?;
                    ensemble::all_modes(tone.parse()?, gain)?
                }
                _ => ensemble::default_knob_sets(),
            };
            let agent = settings.agent(run.model.as_deref())?;
            let signal = prepare_signal(&settings, input.signal()?, run.web).await?;

            let outputs = ensemble::run_ensemble(&agent, &signal, &knob_sets).await?;
            let summary = ensemble::braid(&outputs);
            let record = RunRecord {
                signal,
                outputs,
                summary,
                created_at: Utc::now(),
            };
            finish_run(&settings, &record, run.no_archive).await?;
        }
        Commands::Manual { input, knobs, run } => {
            let knobs = knobs.knobs()?;
            let agent = settings.agent(run.model.as_deref())?;
            let signal = prepare_signal(&settings, input.signal()?, run.web).await?;

            let record = single_run(&agent, signal, &knobs).await?;
            finish_run(&settings, &record, run.no_archive).await?;
        }
        Commands::Intent { text } => {
            let text = text_or_stdin(text)?;
            print_json(&serde_json::json!({
                "detected": detect_web_search_intent(&text),
                "query": parse_web_intent(&text),
            }))?;
        }
        Commands::Search { query, max_results } => {
            let client = settings.search_client()?;
            let max = max_results.unwrap_or(settings.search_max_results);
            let results = client.search(&query, max).await?;
            print_json(&results)?;
        }
        Commands::Fetch { url, max_chars } => {
            let fetcher = settings.page_fetcher()?;
            let page = fetcher
                .fetch(&url, max_chars.unwrap_or(settings.fetch_max_chars_per_url))
                .await?;
            print_json(&page)?;
        }
        Commands::Enrich { input } => {
            let signal = prepare_signal(&settings, input.signal()?, true).await?;
            print_json(&signal)?;
        }
        Commands::Chat { command } => run_chat(&settings, command).await?,
    }

    Ok(())
}

async fn run_chat(settings: &Settings, command: ChatCommands) -> CliResult<()> {
    let chat = settings.chat_service()?;

    match command {
        ChatCommands::New {
            knobs,
            model,
            parent,
            message,
        } => {
            let model = model.unwrap_or_else(|| settings.default_model.clone());
            let turn = chat
                .start(knobs.knobs()?, &model, parent, message.as_deref())
                .await?;
            print_json(&turn)?;
        }
        ChatCommands::Say {
            session_id,
            message,
        } => {
            let turn = chat.follow_up(&session_id, &message).await?;
            print_json(&turn)?;
        }
        ChatCommands::Show { session_id } => {
            print_json(&chat.session(&session_id).await?)?;
        }
        ChatCommands::Fork { session_id, knobs } => {
            print_json(&chat.fork(&session_id, knobs.knobs()?).await?)?;
        }
        ChatCommands::Delete { session_id } => {
            chat.delete(&session_id).await?;
            print_json(&serde_json::json!({ "deleted": session_id }))?;
        }
        ChatCommands::Cleanup => {
            let removed = chat.cleanup_expired().await?;
            print_json(&serde_json::json!({
                "removed": removed,
                "active": chat.active_sessions(),
            }))?;
        }
    }
    Ok(())
}

async fn prepare_signal(settings: &Settings, signal: Signal, web: bool) -> CliResult<Signal> {
    if !web {
        return Ok(signal);
    }
    let enricher = settings.web_enricher()?;
    Ok(enricher.enrich(&signal).await)
}

async fn single_run(agent: &Agent, signal: Signal, knobs: &Knobs) -> CliResult<RunRecord> {
    let output = agent.run(&signal, knobs).await?;
    let summary = output.response.clone();
    Ok(RunRecord {
        signal,
        outputs: vec![output],
        summary,
        created_at: Utc::now(),
    })
}

async fn finish_run(settings: &Settings, record: &RunRecord, no_archive: bool) -> CliResult<()> {
    if !no_archive {
        let archive = settings.archive()?;
        archive.append(record).await?;
        tracing::info!(path = %archive.path().display(), "run archived");
    }
    print_json(record)
}

fn text_or_stdin(text: Option<String>) -> CliResult<String> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    if text.trim().is_empty() {
        return Err("input text is empty".into());
    }
    Ok(text)
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}
