//! Verdict-producing analysis step.
//!
//! The dispatcher only knows the [`AnalysisEngine`] trait. Swapping the
//! stand-in for a real sandbox means handing a different engine to
//! [`crate::jobs::dispatcher::JobDispatcher::new`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

mod static_engine;

pub use static_engine::StaticAnalysisEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictLabel {
    Clean,
    Suspicious,
    Malicious,
}

/// What an engine decides about one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVerdict {
    pub verdict: VerdictLabel,
    pub score: u32,
    pub details: String,
}

/// Input handed to an engine. `fetched` maps filename to byte length and only
/// holds attachments whose download succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub job_id: Uuid,
    pub urls: Vec<String>,
    pub attachment_filenames: Vec<String>,
    pub fetched: BTreeMap<String, usize>,
}

/// The record persisted as a job's verdict: the engine's decision plus what
/// was looked at to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(flatten)]
    pub engine: EngineVerdict,
    pub urls_scanned: Vec<String>,
    pub attachments_scanned: Vec<String>,
    pub attachments_fetched: BTreeMap<String, usize>,
}

impl Verdict {
    pub fn new(engine: EngineVerdict, request: AnalysisRequest) -> Self {
        Self {
            engine,
            urls_scanned: request.urls,
            attachments_scanned: request.attachment_filenames,
            attachments_fetched: request.fetched,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("analysis engine failed: {0}")]
    Engine(String),

    #[error("verdict could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<EngineVerdict, AnalysisError>;
}
