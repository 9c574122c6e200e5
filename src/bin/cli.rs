//! Reverie CLI
//!
//! Operator commands against the memory store.

use std::sync::Arc;

use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};

use reverie::error::{Result, ReverieError};
use reverie::llm::create_completer;
use reverie::pipeline::{ConsolidationContext, ConsolidationOrchestrator};
use reverie::storage::{MemoryStore, Storage};
use reverie::types::*;

#[derive(Parser)]
#[command(name = "reverie")]
#[command(about = "Reverie memory consolidation CLI")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(
        long,
        env = "REVERIE_DB_PATH",
        default_value = "~/.local/share/reverie/reverie.db"
    )]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a transcript for the next consolidation batch
    Add {
        /// Transcript text
        text: String,
        /// Timestamp as YYYY-MM-DD HH-MM-SS (default: now)
        #[arg(short, long)]
        timestamp: Option<String>,
    },
    /// List memory blocks, newest first
    List {
        /// Maximum number to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List today's memory blocks
    Today,
    /// Show a memory block by ID
    Get {
        /// Memory ID
        id: String,
    },
    /// List transcripts waiting for consolidation
    Transcripts,
    /// Run one consolidation batch now
    Consolidate {
        /// Completion API key
        #[arg(long, env = "REVERIE_LLM_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        /// Completion base URL (default: Groq)
        #[arg(long, env = "REVERIE_LLM_BASE_URL")]
        base_url: Option<String>,
        #[arg(long, env = "REVERIE_LLM_MODEL", default_value = DEFAULT_COMPLETION_MODEL)]
        model: String,
        /// Look back this many seconds instead of one poll interval
        #[arg(long, default_value = "62")]
        window_secs: u64,
    },
    /// Show store statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Expand ~ in path
    let db_path = shellexpand::tilde(&cli.db_path).to_string();

    let storage = Storage::open(StorageConfig {
        db_path,
        storage_mode: StorageMode::Local,
    })?;

    match cli.command {
        Commands::Add { text, timestamp } => {
            if text.trim().is_empty() {
                return Err(ReverieError::Validation("transcript text is empty".to_string()));
            }
            let timestamp = match timestamp {
                Some(ts) => {
                    NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).map_err(|_| {
                        ReverieError::Validation(format!(
                            "timestamp '{}' does not match {}",
                            ts, TIMESTAMP_FORMAT
                        ))
                    })?;
                    ts
                }
                None => now_timestamp(),
            };
            let id = storage.create_transcription(text.trim(), &timestamp)?;
            println!("Stored transcript {} at {}", id, timestamp);
        }

        Commands::List { limit } => {
            for block in storage.get_memories()?.into_iter().take(limit) {
                print_block_line(&block);
            }
        }

        Commands::Today => {
            for block in storage.get_memories_on(&today_prefix())? {
                print_block_line(&block);
            }
        }

        Commands::Get { id } => {
            let block = storage
                .get_memory(&id)?
                .ok_or_else(|| ReverieError::NotFound(format!("memory {}", id)))?;
            println!("{}", serde_json::to_string_pretty(&block)?);
        }

        Commands::Transcripts => {
            for record in storage.get_transcriptions(None)? {
                println!("{} [{}] {}", record.id, record.timestamp, truncate(&record.text, 70));
            }
        }

        Commands::Consolidate {
            api_key,
            base_url,
            model,
            window_secs,
        } => {
            let completer = create_completer(&CompletionConfig {
                api_key,
                base_url,
                model,
                ..Default::default()
            })?;
            // window_secs is the whole look-back
            let config = ConsolidationConfig {
                poll_interval_secs: window_secs,
                safety_buffer_secs: 0,
                ..Default::default()
            };
            let orchestrator = ConsolidationOrchestrator::new(Arc::new(storage), completer, config);

            let runtime = tokio::runtime::Runtime::new()?;
            let mut ctx = ConsolidationContext::new();
            let report = runtime.block_on(orchestrator.run_batch(&mut ctx));
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Stats => {
            let stats = storage.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn print_block_line(block: &MemoryBlock) {
    let image = if block.image_url.is_some() { " [img]" } else { "" };
    println!(
        "{} [{}] {}{} - {}",
        block.id,
        block.timestamp,
        block.content.topic,
        image,
        truncate(&block.content.summary, 60)
    );
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
