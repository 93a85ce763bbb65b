use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisEngine, AnalysisError, AnalysisRequest, Verdict};
use crate::attachments::AttachmentFetcher;
use crate::jobs::model::{Job, JobPayload, JobStatus};
use crate::jobs::store::{JobStore, StoreError};

/// How a delivery was handled. Every variant is final for the delivery and
/// gets acknowledged; only a [`DispatchFault`] leaves it pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job reached a terminal status (COMPLETED or FAILED) and it was
    /// committed.
    Processed(JobStatus),
    /// No job record exists for the payload's id.
    RecordMissing,
    /// The payload could not be read as a job.
    MalformedPayload,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Processed(JobStatus::Failed) => "processed_failed",
            Outcome::Processed(_) => "processed_completed",
            Outcome::RecordMissing => "record_missing",
            Outcome::MalformedPayload => "malformed_payload",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The job record is in an unknown state; the delivery must stay pending.
#[derive(Debug, thiserror::Error)]
pub enum DispatchFault {
    #[error("job {job_id} could not be loaded: {source}")]
    Lookup {
        job_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error("job {job_id} left PENDING, FAILED status could not be persisted: {source}")]
    Persist {
        job_id: Uuid,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Parallel attachment downloads per job.
    pub attachment_concurrency: usize,
    /// Upper bound on a single store call.
    pub store_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            attachment_concurrency: 4,
            store_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn AttachmentFetcher>,
    engine: Arc<dyn AnalysisEngine>,
    settings: DispatchSettings,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn AttachmentFetcher>,
        engine: Arc<dyn AnalysisEngine>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            engine,
            settings,
        }
    }

    /// Drive one job from PENDING to a committed terminal status.
    ///
    /// Attachment and analysis faults end the job FAILED. A failed COMPLETED
    /// write falls back to a separate FAILED write; only when that one fails
    /// too is a fault returned.
    pub async fn dispatch(&self, payload: &JobPayload) -> Result<Outcome, DispatchFault> {
        let job_id = payload.job_id;

        let mut job = match self.bounded(self.store.get(job_id)).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(%job_id, "job record not found, dropping delivery");
                return Ok(Outcome::RecordMissing);
            }
            Err(source) => return Err(DispatchFault::Lookup { job_id, source }),
        };

        if job.status.is_terminal() {
            info!(%job_id, status = %job.status, "job already terminal, reprocessing");
        }
        info!(%job_id, "starting analysis");

        match self.analyze(payload).await {
            Ok(verdict) => {
                job.complete(verdict);
                match self.bounded(self.store.save(&job)).await {
                    Ok(()) => {
                        info!(%job_id, "analysis completed");
                        return Ok(Outcome::Processed(JobStatus::Completed));
                    }
                    Err(e) => {
                        error!(%job_id, error = %e, "could not persist COMPLETED status");
                    }
                }
            }
            Err(e) => {
                error!(%job_id, error = %e, "analysis failed");
            }
        }

        job.fail();
        match self.bounded(self.store.save(&job)).await {
            Ok(()) => {
                warn!(%job_id, "job marked FAILED");
                Ok(Outcome::Processed(JobStatus::Failed))
            }
            Err(source) => {
                error!(%job_id, error = %source, "could not persist FAILED status");
                Err(DispatchFault::Persist { job_id, source })
            }
        }
    }

    async fn analyze(&self, payload: &JobPayload) -> Result<Value, AnalysisError> {
        let fetched = self.fetch_attachments(payload).await;

        let request = AnalysisRequest {
            job_id: payload.job_id,
            urls: payload.extracted_urls.clone(),
            attachment_filenames: payload
                .attachment_metadata
                .iter()
                .map(|att| att.filename.clone())
                .collect(),
            fetched,
        };

        // Run the engine on its own task so a panicking engine fails the job
        // instead of the worker.
        let engine = Arc::clone(&self.engine);
        let (request, result) = tokio::spawn(async move {
            let result = engine.analyze(&request).await;
            (request, result)
        })
        .await
        .map_err(|e| AnalysisError::Engine(format!("analysis task aborted: {e}")))?;

        let verdict = Verdict::new(result?, request);
        Ok(serde_json::to_value(&verdict)?)
    }

    /// Fetch every declared attachment; the map holds filename -> byte length
    /// for the ones that arrived. All fetch tasks are joined before returning.
    async fn fetch_attachments(&self, payload: &JobPayload) -> BTreeMap<String, usize> {
        let job_id = payload.job_id;
        let mut fetched = BTreeMap::new();

        let Some(message_id) = payload.source_message_id.as_deref() else {
            if payload
                .attachment_metadata
                .iter()
                .any(|att| att.fetchable_id().is_some())
            {
                warn!(%job_id, "attachments declared without a source message id, skipping fetch");
            }
            return fetched;
        };

        let permits = Arc::new(Semaphore::new(self.settings.attachment_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for att in &payload.attachment_metadata {
            let Some(attachment_id) = att.fetchable_id() else {
                continue;
            };

            let fetcher = Arc::clone(&self.fetcher);
            let permits = Arc::clone(&permits);
            let message_id = message_id.to_string();
            let attachment_id = attachment_id.to_string();
            let filename = att.filename.clone();

            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let bytes = fetcher.fetch(&message_id, &attachment_id).await;
                (filename, attachment_id, bytes)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((filename, _, Some(bytes))) if !bytes.is_empty() => {
                    info!(%job_id, filename = %filename, bytes = bytes.len(), "attachment fetched");
                    fetched.insert(filename, bytes.len());
                }
                Ok((filename, attachment_id, _)) => {
                    warn!(
                        %job_id,
                        message_id,
                        filename = %filename,
                        attachment_id = %attachment_id,
                        "attachment unavailable, continuing without it"
                    );
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "attachment fetch task failed, continuing without it");
                }
            }
        }

        fetched
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.settings.store_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Timeout(limit)),
        }
    }
}
