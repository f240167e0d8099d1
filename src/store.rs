//! Job records and the store that keeps them.
//!
//! The pipeline reports into a [`JobStore`], but it doesn't care how jobs are
//! persisted. [`MemoryJobStore`] keeps everything in memory for the lifetime
//! of one CLI invocation.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use reqwest::Url;
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{document::uri_extension, error::StoreError, prelude::*};

/// Where a job is in its lifecycle.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "NOT_STARTED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Is this a final status?
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// Can a job with this status move to `next`?
    ///
    /// A job may fail before it starts (for example, if its document can't
    /// be fetched), but it can only complete once it has started. Setting a
    /// non-terminal status again is allowed and does nothing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (*self, next) {
            (JobStatus::NotStarted, JobStatus::Complete) => false,
            (JobStatus::InProgress, JobStatus::NotStarted) => false,
            _ => true,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The file a job is about.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct FileRef {
    /// Unique identifier.
    pub id: Uuid,
    /// Where to fetch the file.
    pub uri: String,
    /// Free-form description.
    pub description: String,
    /// Size of the file, once we've fetched it.
    pub size_bytes: Option<u64>,
}

impl FileRef {
    /// Refer to the file at `uri`. Its size is unknown until fetched.
    pub fn new(uri: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            uri: uri.into(),
            description: description.into(),
            size_bytes: None,
        }
    }

    /// The last segment of the URI's path.
    pub fn file_name(&self) -> Option<String> {
        match Url::parse(&self.uri) {
            Ok(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .map(str::to_owned),
            Err(_) => self
                .uri
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_owned),
        }
    }

    /// The host serving the file, if any.
    pub fn domain(&self) -> Option<String> {
        Url::parse(&self.uri)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
    }

    /// The file name's extension, if any.
    pub fn extension(&self) -> Option<String> {
        let file_name = self.file_name()?;
        uri_extension(&file_name).map(str::to_owned)
    }

    /// Everything we can tell about the file from its URI alone.
    pub fn details(&self) -> FileDetails {
        FileDetails {
            file_name: self.file_name(),
            domain: self.domain(),
            extension: self.extension(),
        }
    }
}

/// Facts about a file which are derived from its URI whenever we read it,
/// and never stored.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Eq, Serialize)]
pub struct FileDetails {
    /// The last segment of the URI's path.
    pub file_name: Option<String>,
    /// The host serving the file.
    pub domain: Option<String>,
    /// The file name's extension.
    pub extension: Option<String>,
}

/// One OCR job.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct Job {
    /// Unique identifier.
    pub id: Uuid,
    /// The file to OCR.
    pub file: FileRef,
    /// Free-form description.
    pub description: String,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    /// When the job reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Pages handed back by the OCR engine so far, successfully or not.
    pub files_processed: usize,
    /// Pages in the document, once we know.
    pub total_files: usize,
    /// Human-readable cause, for failed jobs.
    pub failure: Option<String>,
}

impl Job {
    /// A new job that hasn't started yet.
    pub fn new(file: FileRef, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file,
            description: description.into(),
            status: JobStatus::NotStarted,
            start_time: Utc::now(),
            end_time: None,
            files_processed: 0,
            total_files: 0,
            failure: None,
        }
    }
}

/// The text recognized on one page, and how we recognized it.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct Transcript {
    pub job_id: Uuid,
    /// OCR engine version.
    pub engine_version: String,
    /// Imaging library version, or `?`.
    pub imaging_version: String,
    /// MIME type of the page image.
    pub image_type: String,
    pub text: String,
    /// Size of the encoded page image.
    pub size_bytes: usize,
    /// 1-based page number.
    pub page: usize,
    pub total_pages: usize,
}

/// Interface to wherever jobs are kept.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Add a new job.
    async fn create(&self, job: Job) -> Result<(), StoreError>;

    /// Look up a job.
    async fn get(&self, job_id: Uuid) -> Result<Job, StoreError>;

    /// Record how many pages have been processed.
    async fn update_progress(
        &self,
        job_id: Uuid,
        pages_processed: usize,
    ) -> Result<(), StoreError>;

    /// Record how many pages the document has.
    async fn update_total(
        &self,
        job_id: Uuid,
        total_files: usize,
    ) -> Result<(), StoreError>;

    /// Record the size of the fetched file.
    async fn update_file_size(
        &self,
        job_id: Uuid,
        size_bytes: u64,
    ) -> Result<(), StoreError>;

    /// Move a job to a new status, rejecting invalid transitions.
    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Record why a job failed.
    async fn record_failure(
        &self,
        job_id: Uuid,
        cause: String,
    ) -> Result<(), StoreError>;

    /// Save the text of one page.
    async fn add_transcript(&self, transcript: Transcript) -> Result<(), StoreError>;

    /// All transcripts for a job, in page order.
    async fn transcripts(&self, job_id: Uuid) -> Result<Vec<Transcript>, StoreError>;
}

/// A job and everything recorded against it.
struct JobEntry {
    job: Job,
    transcripts: Vec<Transcript>,
}

/// A [`JobStore`] which lives in memory.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the entry for `job_id`, holding the lock only for as
    /// long as it takes.
    fn with_entry<R>(
        &self,
        job_id: Uuid,
        f: impl FnOnce(&mut JobEntry) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let entry = jobs.get_mut(&job_id).ok_or(StoreError::UnknownJob(job_id))?;
        f(entry)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        if jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateJob(job.id));
        }
        jobs.insert(
            job.id,
            JobEntry {
                job,
                transcripts: vec![],
            },
        );
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.with_entry(job_id, |entry| Ok(entry.job.clone()))
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        pages_processed: usize,
    ) -> Result<(), StoreError> {
        self.with_entry(job_id, |entry| {
            entry.job.files_processed = pages_processed;
            Ok(())
        })
    }

    async fn update_total(
        &self,
        job_id: Uuid,
        total_files: usize,
    ) -> Result<(), StoreError> {
        self.with_entry(job_id, |entry| {
            entry.job.total_files = total_files;
            Ok(())
        })
    }

    async fn update_file_size(
        &self,
        job_id: Uuid,
        size_bytes: u64,
    ) -> Result<(), StoreError> {
        self.with_entry(job_id, |entry| {
            entry.job.file.size_bytes = Some(size_bytes);
            Ok(())
        })
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.with_entry(job_id, |entry| {
            let from = entry.job.status;
            if !from.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    job_id,
                    from,
                    to: status,
                });
            }
            debug!(%job_id, %from, to = %status, "Job status changed");
            entry.job.status = status;
            if end_time.is_some() {
                entry.job.end_time = end_time;
            }
            Ok(())
        })
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        cause: String,
    ) -> Result<(), StoreError> {
        self.with_entry(job_id, |entry| {
            entry.job.failure = Some(cause);
            Ok(())
        })
    }

    async fn add_transcript(&self, transcript: Transcript) -> Result<(), StoreError> {
        self.with_entry(transcript.job_id, |entry| {
            entry.transcripts.push(transcript);
            Ok(())
        })
    }

    async fn transcripts(&self, job_id: Uuid) -> Result<Vec<Transcript>, StoreError> {
        self.with_entry(job_id, |entry| {
            let mut transcripts = entry.transcripts.clone();
            transcripts.sort_by_key(|transcript| transcript.page);
            Ok(transcripts)
        })
    }
}
