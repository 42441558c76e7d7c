// src/cli.rs
// Command-line interface for local use and debugging

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use memoria::config::{ApiKeys, EmbeddingsConfig, EngineConfig};
use memoria::db::DatabasePool;
use memoria::embeddings::{Embedder, EmbeddingClient};
use memoria::engine::MemoryEngine;
use memoria::guard::BaselineValidator;
use memoria::llm::completion_from_config;

#[derive(Parser)]
#[command(name = "memoria", version, about = "Persistent per-user semantic memory engine")]
pub struct Cli {
    /// Database path (default: ~/.memoria/memoria.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// User id every command operates under
    #[arg(long, global = true, default_value = "default")]
    pub user: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a chat turn and print the answer with its cited memories
    Chat {
        /// Conversation id
        #[arg(long, default_value = "default")]
        conversation: String,
        /// The message text
        text: String,
    },
    /// Search memories with the hybrid ranker
    Recall {
        /// Query text
        query: String,
    },
    /// List stored memories
    Memories {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List derived insights
    Insights {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Pin or unpin a memory
    Pin {
        memory_id: i64,
        #[arg(long)]
        unpin: bool,
    },
    /// Mark a memory bad (hidden from retrieval)
    Bad { memory_id: i64 },
    /// Correct a memory's text in place
    Correct { memory_id: i64, new_text: String },
    /// Show a task's status
    Status { task_id: String },
}

/// Default database location under the user's home directory.
fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".memoria").join("memoria.db"))
}

/// Build the engine from environment configuration.
async fn build_engine(db_path: Option<PathBuf>) -> Result<MemoryEngine> {
    let api_keys = ApiKeys::from_env();
    let embeddings_config = EmbeddingsConfig::from_env();

    let Some(completion) = completion_from_config(&api_keys) else {
        bail!("no completion provider configured; set DEEPSEEK_API_KEY or OPENAI_API_KEY");
    };

    let embedder: Option<Arc<dyn Embedder>> =
        EmbeddingClient::from_config(&api_keys, &embeddings_config)
            .map(|c| Arc::new(c) as Arc<dyn Embedder>);
    if embedder.is_none() {
        tracing::warn!("no embedding provider configured; retrieval runs without vectors");
    }

    let path = match db_path {
        Some(path) => path,
        None => default_db_path()?,
    };
    let pool = Arc::new(DatabasePool::open(&path, embeddings_config.dimensions).await?);

    Ok(MemoryEngine::new(
        pool,
        embedder,
        Arc::new(completion),
        Arc::new(BaselineValidator),
        EngineConfig::default(),
    ))
}

pub async fn run(cli: Cli) -> Result<()> {
    let engine = build_engine(cli.db).await?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Chat { conversation, text } => {
            let response = engine.assemble_and_answer(user, &conversation, &text).await?;
            println!("{}", response.assistant_text);
            if !response.cited_memory_ids.is_empty() {
                println!("\n[cited memories: {:?}]", response.cited_memory_ids);
            }
        }
        Commands::Recall { query } => {
            let results = engine.retrieve(user, &query, None).await?;
            if results.is_empty() {
                println!("no matching memories");
            }
            for ranked in results {
                println!(
                    "{:.3}  [{}] ({}) {}",
                    ranked.fused,
                    ranked.memory.id,
                    ranked.memory.memory_type,
                    ranked.memory.text
                );
            }
        }
        Commands::Memories { limit } => {
            for memory in engine.list_memories(user, None, limit, 0).await? {
                let flags = match (memory.pinned, memory.bad) {
                    (true, _) => " [pinned]",
                    (_, true) => " [bad]",
                    _ => "",
                };
                println!(
                    "[{}] ({}, conf {:.2}){} {}",
                    memory.id, memory.memory_type, memory.confidence, flags, memory.text
                );
            }
        }
        Commands::Insights { limit } => {
            for insight in engine.list_insights(user, limit).await? {
                println!(
                    "[{}] {} (supports: {:?})",
                    insight.id, insight.content, insight.supporting
                );
            }
        }
        Commands::Pin { memory_id, unpin } => {
            engine.set_pinned(user, memory_id, !unpin).await?;
            println!("memory {memory_id} {}", if unpin { "unpinned" } else { "pinned" });
        }
        Commands::Bad { memory_id } => {
            engine.mark_bad(user, memory_id).await?;
            println!("memory {memory_id} marked bad");
        }
        Commands::Correct { memory_id, new_text } => {
            let task_id = engine.submit_correction(user, memory_id, &new_text).await?;
            println!("correction submitted: {task_id}");
        }
        Commands::Status { task_id } => {
            let task = engine.status(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
    }

    engine.shutdown();
    Ok(())
}
