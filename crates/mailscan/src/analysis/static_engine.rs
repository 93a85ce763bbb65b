use async_trait::async_trait;
use std::time::Duration;

use super::{AnalysisEngine, AnalysisError, AnalysisRequest, EngineVerdict, VerdictLabel};

/// Stand-in engine: waits a fixed delay, then reports every job clean.
#[derive(Debug, Clone)]
pub struct StaticAnalysisEngine {
    delay: Duration,
}

impl StaticAnalysisEngine {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl AnalysisEngine for StaticAnalysisEngine {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<EngineVerdict, AnalysisError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Ok(EngineVerdict {
            verdict: VerdictLabel::Clean,
            score: 10,
            details: format!(
                "Simulated scan of {} url(s) and {} attachment(s), {} fetched.",
                request.urls.len(),
                request.attachment_filenames.len(),
                request.fetched.len()
            ),
        })
    }
}
