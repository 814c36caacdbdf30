//! Fakes shared by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::error::TransferError;
use crate::job::{JobId, JobOutcome, JobState, RemoteRef, SourceRef};
use crate::progress::ProgressSink;
use crate::transfer::{ByteSource, Transport, Upload};

/// Transport whose sources are generated on the fly: `synthetic:<bytes>`.
/// Uploads are discarded and recorded.
#[derive(Debug, Default)]
pub struct SyntheticTransport {
    opened: AtomicUsize,
    delivered: Mutex<Vec<(String, u64)>>,
}

impl SyntheticTransport {
    pub fn source_id(bytes: u64) -> String {
        format!("synthetic:{}", bytes)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<(String, u64)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for SyntheticTransport {
    async fn open_source(&self, source: &SourceRef) -> Result<ByteSource, TransferError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let bytes: u64 = source
            .remote_id
            .strip_prefix("synthetic:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| TransferError::Transport(format!("no such source: {}", source.remote_id)))?;
        Ok(Box::new(tokio::io::repeat(0x47).take(bytes)))
    }

    async fn open_upload(&self, file_name: &str, size: u64) -> Result<Upload, TransferError> {
        self.delivered.lock().unwrap().push((file_name.to_string(), size));
        Ok(Upload {
            writer: Box::new(tokio::io::sink()),
            remote: RemoteRef(format!("synthetic://{}", file_name)),
        })
    }
}

/// Sink that remembers everything it is told
#[derive(Debug, Default)]
pub struct RecordingSink {
    progress: Mutex<Vec<(JobId, JobState, f64)>>,
    finished: Mutex<Vec<(JobId, JobOutcome)>>,
}

impl RecordingSink {
    pub fn progress(&self) -> Vec<(JobId, JobState, f64)> {
        self.progress.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<(JobId, JobOutcome)> {
        self.finished.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, job: JobId, stage: JobState, fraction: f64) {
        self.progress.lock().unwrap().push((job, stage, fraction));
    }

    fn on_finished(&self, job: JobId, outcome: &JobOutcome) {
        self.finished.lock().unwrap().push((job, outcome.clone()));
    }
}

/// Write an executable `/bin/sh` script standing in for the encoder
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Encoder stand-in that reports a 10 second input, emits progress and writes its output
pub const SUCCESSFUL_ENCODER: &str = r#"
for last; do :; done
echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 1000 kb/s" >&2
echo "out_time_us=2500000" >&2
echo "progress=continue" >&2
echo "out_time_us=5000000" >&2
echo "progress=continue" >&2
echo "out_time_us=10000000" >&2
echo "progress=end" >&2
printf 'converted' > "$last"
"#;

/// True once no process with `pid` exists any more
#[cfg(unix)]
pub fn process_gone(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Read a pid written by a test script, waiting briefly for it to appear
pub async fn read_pid(path: &Path) -> i32 {
    for _ in 0..100 {
        if let Ok(text) = tokio::fs::read_to_string(path).await {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("pid file {} never appeared", path.display());
}
