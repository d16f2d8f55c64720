use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use media_monitor::config::Config;
use media_monitor::feed::Fetcher;
use media_monitor::ingest::Coordinator;
use media_monitor::storage::{Database, DatabaseError, NewSource, SourceType};
use media_monitor::summarize::{
    AnalysisPreset, RemoteSummarizer, SummaryRequest, SummaryService,
};
use media_monitor::util::validate_source_url;

#[derive(Parser, Debug)]
#[command(
    name = "media-monitor",
    version,
    about = "Ingest media feeds into SQLite and summarize them with an LLM"
)]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Database path (overrides database_path in the config file)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch every due source and store new items
    Ingest {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configured sources
    Sources {
        #[command(subcommand)]
        action: SourcesCommand,
    },
    /// Delete content older than the retention window
    Cleanup {
        /// Retention in days (defaults to retention_days from the config)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Summarize stored content items
    Summarize {
        /// Content ids, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<i64>,

        #[arg(long, required_unless_present = "preset", conflicts_with = "preset")]
        prompt: Option<String>,

        /// Use a canned analysis prompt
        #[arg(long, value_enum)]
        preset: Option<AnalysisPreset>,

        #[arg(long)]
        json: bool,
    },
    /// Show recently stored summaries
    Summaries {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum SourcesCommand {
    /// List all sources with their fetch state
    List,
    /// Add a source
    Add {
        name: String,
        url: String,
        #[arg(long = "type", value_name = "TYPE")]
        source_type: SourceType,
        /// Refresh interval in seconds
        #[arg(long)]
        interval: Option<i64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Stop fetching a source; its content is kept
    Deactivate { name: String },
    /// Clear the failure counter of a source tripped by the circuit breaker
    Reset { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let db_path = match &args.db {
        Some(path) => path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?
            .to_owned(),
        None => config.database_path.clone(),
    };

    let db = match Database::open(&db_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another media-monitor process appears to hold the database. Please wait for it to finish and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    db.sync_sources(&config.sources)
        .await
        .context("Failed to sync sources from config")?;

    match args.command {
        Command::Ingest { json } => ingest(&config, db, json).await,
        Command::Sources { action } => sources(&config, &db, action).await,
        Command::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let removed = db
                .cleanup_old_content(days)
                .await
                .context("Failed to clean up old content")?;
            println!("Removed {} items older than {} days", removed, days);
            Ok(())
        }
        Command::Summarize {
            ids,
            prompt,
            preset,
            json,
        } => {
            let prompt = match (prompt, preset) {
                (Some(prompt), _) => prompt,
                (None, Some(preset)) => preset.prompt().to_owned(),
                (None, None) => anyhow::bail!("Either --prompt or --preset is required"),
            };
            summarize(&config, db, ids, prompt, json).await
        }
        Command::Summaries { limit } => {
            let summaries = db
                .recent_summaries(limit)
                .await
                .context("Failed to load summaries")?;
            if summaries.is_empty() {
                println!("No summaries yet.");
            }
            for s in summaries {
                let created = chrono::DateTime::from_timestamp(s.created_at, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "#{} {} ({}, items {:?})\n{}\n",
                    s.id, created, s.model_used, s.content_ids, s.summary_text
                );
            }
            Ok(())
        }
    }
}

async fn ingest(config: &Config, db: Database, json: bool) -> Result<()> {
    let fetcher = Fetcher::new(&config.fetch.user_agent, config.fetch_policy())
        .context("Failed to build HTTP client")?;
    let coordinator = Coordinator::new(Arc::new(db), fetcher, config.ingest_options());

    let report = coordinator.run().await.context("Ingestion run failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to encode report")?
        );
    } else {
        println!("{}", report);
    }

    if report.is_total_failure() {
        std::process::exit(1);
    }
    Ok(())
}

async fn sources(config: &Config, db: &Database, action: SourcesCommand) -> Result<()> {
    match action {
        SourcesCommand::List => {
            let sources = db.list_sources().await.context("Failed to list sources")?;
            if sources.is_empty() {
                println!("No sources configured. Add [[sources]] to the config or run `media-monitor sources add`.");
            }
            for s in sources {
                let last = s
                    .last_updated
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let state = if !s.is_active {
                    "inactive".to_string()
                } else if s.consecutive_failures > 0 {
                    format!("{} failures", s.consecutive_failures)
                } else {
                    "ok".to_string()
                };
                println!(
                    "{:>4}  {:<32} {:<16} {:<12} {}  {}",
                    s.id, s.name, s.source_type, state, last, s.url
                );
            }
        }
        SourcesCommand::Add {
            name,
            url,
            source_type,
            interval,
            description,
        } => {
            let url = validate_source_url(&url, config.fetch.allow_private_hosts)
                .with_context(|| format!("Rejected source URL '{}'", url))?;
            let mut source = NewSource::new(name, url.as_str(), source_type);
            source.description = description;
            if let Some(interval) = interval {
                source.update_interval = interval;
            }
            let id = db
                .add_source(&source)
                .await
                .with_context(|| format!("Failed to add source '{}'", source.name))?;
            println!("Added source #{}: {}", id, source.name);
        }
        SourcesCommand::Deactivate { name } => {
            if db
                .deactivate_source(&name)
                .await
                .context("Failed to deactivate source")?
            {
                println!("Deactivated {}", name);
            } else {
                anyhow::bail!("No source named '{}'", name);
            }
        }
        SourcesCommand::Reset { name } => {
            let source = db
                .find_source_by_name(&name)
                .await
                .context("Failed to look up source")?
                .ok_or_else(|| anyhow::anyhow!("No source named '{}'", name))?;
            db.reset_source_failures(source.id)
                .await
                .context("Failed to reset source")?;
            println!("Reset failure count for {}", name);
        }
    }
    Ok(())
}

async fn summarize(
    config: &Config,
    db: Database,
    ids: Vec<i64>,
    prompt: String,
    json: bool,
) -> Result<()> {
    let api_key = config.summarizer.resolve_api_key().ok_or_else(|| {
        anyhow::anyhow!(
            "No API key configured. Set {} or [summarizer] api_key in the config file.",
            media_monitor::config::API_KEY_ENV
        )
    })?;

    let summarizer = RemoteSummarizer::new(
        config.summarizer.api_url.clone(),
        api_key,
        config.summarizer.model.clone(),
    )
    .with_timeout(config.summarizer.timeout());
    let service = SummaryService::new(db, Arc::new(summarizer))
        .with_max_tokens(config.summarizer.max_tokens);

    let response = service
        .summarize(&SummaryRequest {
            content_ids: ids,
            prompt,
        })
        .await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).context("Failed to encode summary")?
        );
    } else {
        println!("{}", response.summary_text);
        eprintln!(
            "\nsummary #{} by {} ({} tokens)",
            response.summary_id,
            response.model_used,
            response
                .tokens_used
                .map(|t| t.to_string())
                .unwrap_or_else(|| "?".into())
        );
    }
    Ok(())
}
