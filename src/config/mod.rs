// src/config/mod.rs
// Configuration and shared constants

pub mod engine;
pub mod env;

pub use engine::{
    EngineConfig, InsightConfig, OrchestratorConfig, RetrievalConfig, SummaryConfig, WriterConfig,
};
pub use env::{ApiKeys, EmbeddingsConfig};
