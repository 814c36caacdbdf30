use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::error::JobError;

/// Upper bound on a single ffprobe run
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<String>,
    pub disposition: Option<HashMap<String, i32>>,
}

impl FFProbeStream {
    pub fn is_video(&self) -> bool {
        // cover art shows up as a one-frame video stream
        let attached_pic = self
            .disposition
            .as_ref()
            .and_then(|d| d.get("attached_pic"))
            .copied()
            .unwrap_or(0)
            == 1;
        self.codec_type.as_deref() == Some("video") && !attached_pic
    }
}

impl FFProbeData {
    pub fn has_video(&self) -> bool {
        self.streams.iter().any(FFProbeStream::is_video)
    }

    /// Container duration, falling back to the longest stream
    pub fn duration(&self) -> Option<Duration> {
        let format_secs = self
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(parse_secs);
        let secs = format_secs.or_else(|| {
            self.streams
                .iter()
                .filter_map(|s| s.duration.as_deref().and_then(parse_secs))
                .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.max(d))))
        })?;
        Some(Duration::from_secs_f64(secs))
    }
}

fn parse_secs(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|s| s.is_finite() && *s > 0.0)
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe not runnable at {binary}: {source}")]
    Unavailable {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffprobe failed (exit code {exit_code:?}): {stderr}")]
    Failed { exit_code: Option<i32>, stderr: String },

    #[error("ffprobe did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("unreadable ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Run ffprobe on a local file and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<FFProbeData, ProbeError> {
    debug!("Executing ffprobe for: {}", file_path.display());

    let mut cmd = Command::new(ffprobe_bin);
    cmd.arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ProbeError::Unavailable {
                binary: ffprobe_bin.to_path_buf(),
                source: e,
            })
        }
        Err(_) => return Err(ProbeError::TimedOut(PROBE_TIMEOUT)),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        return Err(ProbeError::Failed {
            exit_code: output.status.code(),
            stderr: last.chars().take(200).collect(),
        });
    }

    Ok(serde_json::from_slice(&output.stdout)?)
}

/// Validate a staged source: non-empty and, when ffprobe is available, holding
/// at least one video stream. Returns the source duration when it is known.
pub async fn validate_source(ffprobe_bin: Option<&Path>, file_path: &Path) -> Result<Option<Duration>, JobError> {
    let size = tokio::fs::metadata(file_path)
        .await
        .map_err(|e| JobError::internal(format!("staged source vanished: {}", e)))?
        .len();
    if size == 0 {
        return Err(JobError::validation("the file is empty"));
    }

    let Some(bin) = ffprobe_bin else {
        return Ok(None);
    };

    match probe_file(bin, file_path).await {
        Ok(data) if !data.has_video() => Err(JobError::validation("no video stream found")),
        Ok(data) => {
            let duration = data.duration();
            debug!("Probed {}: duration {:?}, {} streams", file_path.display(), duration, data.streams.len());
            Ok(duration)
        }
        Err(ProbeError::Failed { stderr, .. }) => Err(JobError::validation(format!("not a readable video file ({})", stderr))),
        Err(ProbeError::Unavailable { binary, source }) if source.kind() == IoErrorKind::NotFound => {
            warn!("⚠️  ffprobe not found at {}, skipping source inspection", binary.display());
            Ok(None)
        }
        Err(e) => {
            warn!("⚠️  Could not inspect {}: {}", file_path.display(), e);
            Ok(None)
        }
    }
}
