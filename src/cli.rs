//! CLI interface for polymind

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use futures_util::StreamExt;
use std::io::Write;
use std::path::PathBuf;

use crate::config::{self, Config};
use crate::dispatch::{DispatchMode, DispatchRequest};
use crate::learner::{Learner, LearnerError};
use crate::providers::ImageData;
use crate::server;
use crate::types::{Depth, StreamEvent};

#[derive(Parser)]
#[command(name = "polymind")]
#[command(about = "Multi-provider reasoning gateway with fallback dispatch and a self-learning interaction store", long_about = None)]
#[command(version)]
struct Cli {
    /// Use an alternate config file
    #[arg(long, global = true, env = "POLYMIND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Dispatch one request from the terminal
    Ask {
        /// The message to send
        message: String,
        /// Reasoning effort: quick, normal, or deep
        #[arg(short, long, default_value = "normal")]
        depth: Depth,
        /// Provider to use, or "auto" for the fallback chain
        #[arg(short, long, default_value = "auto")]
        model: DispatchMode,
        /// Attach an image file (sent to vision-capable providers)
        #[arg(long)]
        image: Option<PathBuf>,
        /// Classification tags for the learner
        #[arg(short, long)]
        tag: Vec<String>,
        /// Wait for the full answer instead of streaming
        #[arg(long)]
        no_stream: bool,
    },
    /// Show learning statistics
    Stats,
    /// List learned patterns
    Patterns {
        /// Show only the pattern for this tag
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Revise the outcome of a recorded interaction
    Feedback {
        /// Interaction id (printed by `ask`, or the API's x-interaction-id)
        id: String,
        /// Whether the response was actually correct
        #[arg(long, action = ArgAction::Set)]
        success: bool,
        /// Free-text note stored alongside the outcome
        #[arg(long)]
        note: Option<String>,
    },
    /// Show the effective configuration
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path.clone())?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Serve { host, port } => {
            server::start(config, host, port).await?;
        }
        Commands::Ask {
            message,
            depth,
            model,
            image,
            tag,
            no_stream,
        } => {
            ask(config, message, depth, model, image, tag, no_stream).await?;
        }
        Commands::Stats => {
            let learner = open_learner(&config).await?;
            let stats = learner.stats().await?;
            println!("Interactions:  {}", stats.total_interactions);
            println!("Successful:    {}", stats.successful_interactions);
            println!("Success rate:  {:.1}%", stats.success_rate * 100.0);
            println!("Patterns:      {}", stats.patterns_identified);
            if !stats.top_success_strategies.is_empty() {
                println!();
                println!("Top strategies:");
                for strategy in &stats.top_success_strategies {
                    println!(
                        "  {:<20} {:>5.1}%  ({} interactions)",
                        strategy.pattern_type,
                        strategy.success_rate * 100.0,
                        strategy.occurrences
                    );
                }
            }
        }
        Commands::Patterns { tag } => {
            let learner = open_learner(&config).await?;
            let patterns = match tag.as_deref() {
                Some(tag) => learner.patterns_for(tag).into_iter().collect(),
                None => learner.patterns(),
            };
            if patterns.is_empty() {
                println!("No patterns recorded yet.");
            }
            for pattern in patterns {
                println!(
                    "{:<20} occurrences={:<5} success={:>5.1}%  confidence={:.2}",
                    pattern.pattern_type,
                    pattern.occurrences,
                    pattern.success_rate * 100.0,
                    pattern.confidence
                );
            }
        }
        Commands::Feedback { id, success, note } => {
            let learner = open_learner(&config).await?;
            match learner.apply_feedback(&id, success, note.as_deref()).await {
                Ok(()) => println!("✓ Feedback recorded for {}", id),
                Err(LearnerError::NotFound(id)) => {
                    eprintln!("No interaction with id '{}'", id);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Config { path } => {
            let config_path = config::config_path()?;
            if path {
                println!("{}", config_path.display());
            } else {
                println!("# {}", config_path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

async fn open_learner(config: &Config) -> Result<Learner> {
    let db_path = config.storage.database_path()?;
    Learner::open(&db_path)
        .await
        .with_context(|| format!("Failed to open interaction store at {}", db_path.display()))
}

async fn ask(
    config: Config,
    message: String,
    depth: Depth,
    mode: DispatchMode,
    image: Option<PathBuf>,
    tags: Vec<String>,
    no_stream: bool,
) -> Result<()> {
    let (dispatcher, _learner) = server::build_core(&config).await?;

    let mut request = DispatchRequest::new(message)
        .with_depth(depth)
        .with_tags(tags);
    if let Some(path) = image {
        request = request.with_image(load_image(&path)?);
    }

    let stream = match dispatcher.dispatch(request, mode).await {
        Ok(stream) => stream,
        Err(error) => {
            eprintln!("✗ {}", error);
            std::process::exit(1);
        }
    };

    eprintln!(
        "provider: {}  interaction: {}",
        stream.provider(),
        stream.interaction_id()
    );

    if no_stream {
        let collected = stream.collect().await;
        for step in &collected.steps {
            eprintln!("[step {}] {} ({:.2})", step.index, step.thought, step.confidence);
        }
        println!("{}", collected.response);
        if let Some(failure) = collected.error {
            eprintln!("✗ stream failed: {}", failure.message);
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut stream = stream;
    let mut failed = false;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Content(text) => {
                print!("{}", text);
                std::io::stdout().flush()?;
            }
            StreamEvent::Step(step) => {
                eprintln!("[step {}] {} ({:.2})", step.index, step.thought, step.confidence);
            }
            StreamEvent::Error(failure) => {
                eprintln!();
                eprintln!("✗ stream failed: {}", failure.message);
                failed = true;
            }
        }
    }
    println!();

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn load_image(path: &PathBuf) -> Result<ImageData> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    let media_type = match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Ok(ImageData {
        media_type: media_type.to_string(),
        data: BASE64.encode(bytes),
    })
}
