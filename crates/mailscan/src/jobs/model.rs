use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// One analysis job as persisted in `analysis_jobs`.
///
/// Jobs are created PENDING by the ingress side and only ever moved to a
/// terminal status by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// Opaque verdict blob, see [`crate::analysis::Verdict`] for what the
    /// dispatcher writes.
    pub verdict: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn pending(id: Uuid) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            verdict: None,
            updated_at: Utc::now(),
        }
    }

    pub fn complete(&mut self, verdict: Value) {
        self.status = JobStatus::Completed;
        self.verdict = Some(verdict);
        self.updated_at = Utc::now();
    }

    /// FAILED carries no verdict, even if an earlier run left one behind.
    pub fn fail(&mut self) {
        self.status = JobStatus::Failed;
        self.verdict = None;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    pub filename: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

impl AttachmentMetadata {
    /// The Gmail attachment id, if one was declared and is non-blank.
    pub fn fetchable_id(&self) -> Option<&str> {
        self.attachment_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// The body of a single queue delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPayload {
    pub job_id: Uuid,
    pub source_message_id: Option<String>,
    pub attachment_metadata: Vec<AttachmentMetadata>,
    pub extracted_urls: Vec<String>,
}

pub const FIELD_JOB_ID: &str = "job_id";
pub const FIELD_SOURCE_MESSAGE_ID: &str = "source_message_id";
pub const FIELD_ATTACHMENT_METADATA: &str = "attachment_metadata";
pub const FIELD_EXTRACTED_URLS: &str = "extracted_urls";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("malformed job id {value:?}: {source}")]
    InvalidJobId {
        value: String,
        #[source]
        source: uuid::Error,
    },

    #[error("field `{field}` is not valid JSON of the expected shape: {source}")]
    InvalidField {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl JobPayload {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            source_message_id: None,
            attachment_metadata: Vec::new(),
            extracted_urls: Vec::new(),
        }
    }

    /// Parse the flat field map of a stream entry.
    ///
    /// `attachment_metadata` and `extracted_urls` are JSON arrays encoded as
    /// strings; a missing field means an empty list.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, PayloadError> {
        let raw_id = fields
            .get(FIELD_JOB_ID)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or(PayloadError::MissingField(FIELD_JOB_ID))?;

        let job_id = parse_job_id(raw_id)?;

        let source_message_id = fields
            .get(FIELD_SOURCE_MESSAGE_ID)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let attachment_metadata = json_list(fields, FIELD_ATTACHMENT_METADATA)?;
        let extracted_urls = json_list(fields, FIELD_EXTRACTED_URLS)?;

        Ok(Self {
            job_id,
            source_message_id,
            attachment_metadata,
            extracted_urls,
        })
    }

    /// Field/value pairs in the shape [`JobPayload::from_fields`] reads back.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut fields = vec![(FIELD_JOB_ID, self.job_id.to_string())];
        if let Some(message_id) = &self.source_message_id {
            fields.push((FIELD_SOURCE_MESSAGE_ID, message_id.clone()));
        }
        fields.push((
            FIELD_ATTACHMENT_METADATA,
            serde_json::to_string(&self.attachment_metadata)?,
        ));
        fields.push((
            FIELD_EXTRACTED_URLS,
            serde_json::to_string(&self.extracted_urls)?,
        ));
        Ok(fields)
    }
}

pub fn parse_job_id(raw: &str) -> Result<Uuid, PayloadError> {
    Uuid::parse_str(raw.trim()).map_err(|source| PayloadError::InvalidJobId {
        value: raw.to_string(),
        source,
    })
}

fn json_list<T: for<'de> Deserialize<'de>>(
    fields: &HashMap<String, String>,
    field: &'static str,
) -> Result<Vec<T>, PayloadError> {
    match fields.get(field).map(|s| s.trim()) {
        None | Some("") => Ok(Vec::new()),
        Some(raw) => {
            serde_json::from_str(raw).map_err(|source| PayloadError::InvalidField { field, source })
        }
    }
}
