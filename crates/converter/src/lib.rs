pub mod config;
pub mod encoder;
pub mod error;
pub mod ffprobe;
pub mod job;
pub mod orchestrator;
pub mod profile;
pub mod progress;
pub mod transfer;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use config::ConverterConfig;
pub use encoder::{EncoderSupervisor, EncoderVersion};
pub use error::{EncodeFailure, ErrorKind, JobError};
pub use job::{ConversionJob, JobId, JobOutcome, JobState, RemoteRef, SourceRef, VIDEO_EXTENSIONS};
pub use orchestrator::{JobHandle, JobOrchestrator, OrchestratorStats};
pub use profile::{EncodeProfile, ProfileRegistry};
pub use progress::{NullSink, ProgressSink};
pub use transfer::{LocalTransport, Transport};
pub use workspace::WorkspaceManager;
