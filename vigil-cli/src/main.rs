// Vigil command line interface
// Live camera annotation with persistent face identities

mod console;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_eye::recognizer::recognizers_from_config;
use vigil_eye::registry::IdentityRegistry;
use vigil_eye::source::candidate_addresses;
use vigil_eye::{RecognitionOrchestrator, RecognizerKind, Session, SessionReport, SourceAcquirer, SystemClock, VisionConfig};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Real-time face, object and text annotation for local and network cameras", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, env = "VIGIL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a source and annotate it until quit
    Run {
        /// Device index, http://host:port/path or rtsp://host:port/path
        #[arg(long, short)]
        source: Option<String>,

        /// Configuration file (TOML or JSON)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Identity registry file
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Start with face recognition disabled
        #[arg(long)]
        no_faces: bool,

        /// Start with object detection disabled
        #[arg(long)]
        no_objects: bool,

        /// Start with text recognition disabled
        #[arg(long)]
        no_text: bool,
    },

    /// List stored identities
    Identities {
        /// Identity registry file
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Configuration file (TOML or JSON)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Print stream addresses worth trying for a phone or IP camera
    Candidates {
        /// Camera IP address, e.g. 192.168.0.107
        ip: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<VisionConfig> {
    let mut config = match path {
        Some(path) => VisionConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => VisionConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Run {
            source,
            config,
            registry,
            no_faces,
            no_objects,
            no_text,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(source) = source {
                config.source.descriptor = source;
            }
            if let Some(registry) = registry {
                config.registry.path = registry;
            }
            for (kind, disabled) in [
                (RecognizerKind::Faces, no_faces),
                (RecognizerKind::Objects, no_objects),
                (RecognizerKind::Text, no_text),
            ] {
                if disabled {
                    config.cadence.get_mut(kind).enabled = false;
                }
            }
            config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;
            run(config).await?;
        }
        Commands::Identities { registry, config, json } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(registry) = registry {
                config.registry.path = registry;
            }
            show_identities(&config, json)?;
        }
        Commands::Candidates { ip, json } => {
            show_candidates(&ip, json)?;
        }
    }

    Ok(())
}

/// Blocking HTTP clients live entirely on the session thread
fn build_session(config: VisionConfig, interrupt: Arc<AtomicBool>) -> anyhow::Result<Session> {
    let lines = console::spawn_stdin_reader().context("starting the stdin reader")?;

    let (control, prompter) = console::console(lines, interrupt.clone());

    let recognizers = recognizers_from_config(&config.recognizers)?;
    if recognizers.is_empty() {
        warn!("No recognizer endpoints configured; frames will not be annotated");
    }
    let orchestrator = RecognitionOrchestrator::new(
        recognizers,
        config.recognizers.clone(),
        &config.operator,
        Box::new(prompter),
        Box::new(SystemClock),
    );
    let acquirer = SourceAcquirer::new(config.source.clone())?;

    info!("Controls: q quit | s save frame | t [faces|objects|text] toggle");
    Ok(Session::new(
        config,
        acquirer,
        orchestrator,
        Box::new(control),
        Box::new(console::LogRenderer::new()),
    )
    .with_interrupt(interrupt))
}

async fn run(config: VisionConfig) -> anyhow::Result<()> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let session_interrupt = interrupt.clone();
    let mut task = tokio::task::spawn_blocking(move || -> anyhow::Result<SessionReport> {
        let mut session = build_session(config, session_interrupt)?;
        Ok(session.run()?)
    });
    let outcome = tokio::select! {
        outcome = &mut task => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, shutting down");
            interrupt.store(true, Ordering::Relaxed);
            task.await
        }
    };

    let report = outcome.context("session thread panicked")??;
    println!("Session ended: {:?}", report.reason);
    println!("  Cycles:        {}", report.cycles);
    println!("  Frames saved:  {}", report.frames_saved);
    println!("  Identities:    {}", report.identities);
    if report.fallback_used {
        println!("  Fallback:      HTTP substitute was used");
    }
    Ok(())
}

fn show_identities(config: &VisionConfig, json: bool) -> anyhow::Result<()> {
    let (registry, warning) = IdentityRegistry::load(config.registry.path.clone(), config.registry.match_threshold);
    if let Some(warning) = warning {
        warn!("{}", warning);
    }

    if json {
        let records: Vec<_> = registry
            .records()
            .iter()
            .map(|r| {
                serde_json::json!({
                    "label": r.label,
                    "created_at": r.created_at.to_rfc3339(),
                    "dimension": r.embedding.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let stats = registry.stats();
    println!("{} ({} records, {} names)", registry.path().display(), stats.records, stats.labels.len());
    for record in registry.records() {
        println!("  {:<24} {}", record.label, record.created_at.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

fn show_candidates(ip: &str, json: bool) -> anyhow::Result<()> {
    let candidates = candidate_addresses(ip);
    if json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }

    let mut current = "";
    for candidate in &candidates {
        if candidate.app != current {
            println!("{}:", candidate.app);
            current = candidate.app;
        }
        println!("  {}", candidate.address);
    }
    println!("\nTry one with: vigil run --source <address>");
    Ok(())
}
