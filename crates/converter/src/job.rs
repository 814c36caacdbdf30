//! Conversion job model: identifiers, states and the job snapshot observers see.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Container extensions accepted as conversion input
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "webm", "flv", "wmv", "mpg", "mpeg", "ts", "3gp",
];

/// Opaque job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an inbound payload as the transport describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Transport-specific identifier of the payload
    pub remote_id: String,
    /// Original file name, used for format checks and output naming
    pub file_name: String,
    /// Size announced by the transport, if any
    pub declared_size: Option<u64>,
    /// MIME type announced by the transport, if any
    pub mime_type: Option<String>,
    /// Submitting user, for per-owner admission limits
    pub owner: Option<String>,
}

impl SourceRef {
    pub fn new(remote_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            file_name: file_name.into(),
            declared_size: None,
            mime_type: None,
            owner: None,
        }
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Lower-cased extension of the original file name
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
    }

    /// Whether the name or the announced MIME type says this is a video
    pub fn looks_like_video(&self) -> bool {
        let by_extension = self
            .extension()
            .map(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        let by_mime = self
            .mime_type
            .as_deref()
            .map(|m| m.trim().to_ascii_lowercase().starts_with("video/"))
            .unwrap_or(false);
        by_extension || by_mime
    }

    /// File name stem, falling back to "video"
    pub fn stem(&self) -> String {
        Path::new(&self.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("video")
            .to_string()
    }
}

/// Identifier of a delivered artifact on the transport side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef(pub String);

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Downloading,
    Validating,
    Encoding,
    Uploading,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    /// Position along the happy path; `None` for the two absorbing failures
    fn rank(&self) -> Option<u8> {
        match self {
            JobState::Queued => Some(0),
            JobState::Downloading => Some(1),
            JobState::Validating => Some(2),
            JobState::Encoding => Some(3),
            JobState::Uploading => Some(4),
            JobState::Succeeded => Some(5),
            JobState::Failed | JobState::Cancelled => None,
        }
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(cur), Some(nxt)) => nxt == cur + 1,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Illegal state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Last-known progress of the active stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: JobState,
    pub fraction: f64,
}

/// Terminal outcome handed to the result callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded { output: RemoteRef },
    Failed(JobError),
    Cancelled,
}

/// One conversion request from submission to terminal outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: JobId,
    pub source: SourceRef,
    pub profile: String,
    pub state: JobState,
    pub workspace_path: Option<PathBuf>,
    pub progress: Progress,
    pub error: Option<JobError>,
    pub output: Option<RemoteRef>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ConversionJob {
    pub fn new(source: SourceRef, profile: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            source,
            profile: profile.into(),
            state: JobState::Queued,
            workspace_path: None,
            progress: Progress {
                stage: JobState::Queued,
                fraction: 0.0,
            },
            error: None,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, refusing anything that breaks the lifecycle ordering
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        if self.state == JobState::Queued && !next.is_terminal() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        } else {
            self.progress = Progress {
                stage: next,
                fraction: 0.0,
            };
        }
        self.state = next;
        Ok(())
    }

    /// Enter `Succeeded` with the delivered artifact
    pub fn succeed(&mut self, output: RemoteRef) -> Result<(), InvalidTransition> {
        self.transition(JobState::Succeeded)?;
        self.output = Some(output);
        Ok(())
    }

    /// Enter `Failed`; a job already terminal is left untouched
    pub fn fail(&mut self, error: JobError) -> Result<(), InvalidTransition> {
        self.transition(JobState::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobState::Cancelled)
    }

    /// Terminal outcome, once there is one
    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Succeeded => self.output.clone().map(|output| JobOutcome::Succeeded { output }),
            JobState::Failed => Some(JobOutcome::Failed(
                self.error
                    .clone()
                    .unwrap_or_else(|| JobError::internal("job failed without an error")),
            )),
            JobState::Cancelled => Some(JobOutcome::Cancelled),
            _ => None,
        }
    }
}
