//! Error types for each stage of an OCR job.
//!
//! The CLI layer works in [`anyhow::Error`], but the pipeline stages return
//! typed errors so that callers can tell a missing document from a flaky
//! server, or a broken converter from a single unreadable page.

use std::{error::Error as StdError, io};

use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::{prelude::*, store::JobStatus};

/// Failure reported by an external command.
#[derive(Debug, Error)]
#[error("{command} failed with {} and output:\n{output}", describe_exit(.exit_code))]
pub struct CommandFailure {
    /// The name of the command.
    pub command: String,
    /// The exit code, or `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Everything the command printed, stdout first.
    pub output: String,
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_owned(),
    }
}

/// We could not download a document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// We don't know how to fetch this URI.
    #[error("cannot fetch {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The server answered, but not with a success status.
    #[error("{uri} returned HTTP {status}")]
    Status { uri: String, status: StatusCode },

    /// The request never completed.
    #[error("failed to fetch {uri}")]
    Transport {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    /// A local `file://` document could not be read.
    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// The HTTP status returned by the server, if we got that far.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Transport { source, .. } => source.status(),
            FetchError::InvalidUri { .. } | FetchError::Io { .. } => None,
        }
    }

    /// Was the document rejected outright? Asking again will not help.
    pub fn is_not_found(&self) -> bool {
        match self {
            FetchError::InvalidUri { .. } => true,
            FetchError::Status { status, .. } => {
                status.is_client_error() && !status.is_known_transient()
            }
            FetchError::Transport { .. } => false,
            FetchError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
        }
    }

    /// Might this succeed if the caller tried again later?
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::InvalidUri { .. } | FetchError::Io { .. } => false,
            FetchError::Status { status, .. } => status.is_known_transient(),
            FetchError::Transport { source, .. } => source.is_known_transient(),
        }
    }
}

/// Is this error a known transient error?
///
/// Status codes are assumed to be permanent unless they are known to mean
/// "try again later". Transport failures without a status are assumed to be
/// transient, unless they are caused by a bad request, a redirect loop, a
/// TLS failure or a body we can't decode.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self) || self.is_server_error()
    }
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else if self.is_builder() || self.is_redirect() || self.is_decode() {
            false
        } else {
            !is_tls_failure(self)
        }
    }
}

/// Did the TLS handshake fail? The TLS layer reports protocol and
/// certificate errors as [`io::ErrorKind::InvalidData`].
fn is_tls_failure(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::InvalidData {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// The requested recognition language is not installed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "OCR engine is not configured to use the language {lang:?}, supported languages are {}",
    describe_languages(.supported)
)]
pub struct UnsupportedLanguageError {
    /// The language we were asked for.
    pub lang: String,
    /// Everything the engine has installed.
    pub supported: Vec<String>,
}

fn describe_languages(supported: &[String]) -> String {
    if supported.is_empty() {
        "[no traineddata files available!]".to_owned()
    } else {
        supported.join(", ")
    }
}

/// We could not split a document into page images.
#[derive(Debug, Error)]
pub enum RasterError {
    /// We could not create or write the scratch files.
    #[error("cannot prepare rasterization scratch space")]
    Scratch(#[source] io::Error),

    /// The converter binary could not be started at all.
    #[error("failed to run {program}")]
    ConverterUnavailable {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The converter ran and exited unsuccessfully.
    #[error(transparent)]
    ConverterFailed(CommandFailure),

    /// The converter exited successfully but left nothing behind.
    #[error("{program} produced no page images")]
    NoPages { program: String },

    /// A page artifact vanished or could not be read.
    #[error("failed to read page artifact {path:?}")]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A page artifact was not an image we can decode.
    #[error("failed to decode page {page}")]
    Decode {
        page: usize,
        #[source]
        source: image::ImageError,
    },
}

impl RasterError {
    /// The converter's exit code, if it ran and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RasterError::ConverterFailed(failure) => failure.exit_code,
            _ => None,
        }
    }
}

/// We could not recognize text on a page.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguageError),

    /// The engine binary could not be started.
    #[error("failed to run {program}")]
    EngineUnavailable {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The engine ran and exited unsuccessfully.
    #[error(transparent)]
    EngineFailed(CommandFailure),

    /// We could not hand the page to the engine.
    #[error("cannot prepare recognition input")]
    Io(#[source] io::Error),

    /// We could not re-encode the page for the engine.
    #[error("cannot encode page image")]
    Encode(#[source] image::ImageError),
}

impl RecognitionError {
    /// Can the job carry on with its other pages after this error?
    ///
    /// Failures specific to one page are recoverable. Failures of the engine
    /// itself will recur on every page, so they abort the job.
    pub fn is_page_local(&self) -> bool {
        matches!(
            self,
            RecognitionError::EngineFailed(_) | RecognitionError::Encode(_)
        )
    }
}

/// The job store rejected an operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no job with id {0}")]
    UnknownJob(Uuid),

    #[error("a job with id {0} already exists")]
    DuplicateJob(Uuid),

    #[error("job {job_id} cannot go from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Why an OCR job did not produce results.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    UnsupportedLanguage(UnsupportedLanguageError),

    #[error("cannot query OCR engine capabilities")]
    Capabilities(#[source] RecognitionError),

    #[error("failed to fetch document")]
    Fetch(#[from] FetchError),

    #[error("failed to rasterize document")]
    Raster(#[from] RasterError),

    #[error("failed to decode image")]
    Decode(#[source] image::ImageError),

    #[error("failed to recognize page {page}")]
    Recognition {
        page: usize,
        #[source]
        source: RecognitionError,
    },

    #[error("job store error")]
    Store(#[from] StoreError),
}

/// Render an error and all of its sources on one line.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
