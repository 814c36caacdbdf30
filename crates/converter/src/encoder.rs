//! Encoder process supervision.
//!
//! One [`EncoderSupervisor::run`] call owns one encoder child from spawn to
//! reap: it streams the child's diagnostics into progress, enforces the
//! deadline, honours cancellation and classifies the exit.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{EncodeError, EncodeFailure};
use crate::profile::EncodeProfile;
use crate::progress::ProgressParser;

/// Lines of stderr kept for failure diagnostics
const STDERR_TAIL_LINES: usize = 20;
/// Longest stderr line buffered before it is cut
const MAX_LINE_BYTES: u64 = 64 * 1024;
/// How long to wait for the stderr reader once the child is gone
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Encoder version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EncoderVersion {
    /// Parse version from the first line of `ffmpeg -version`
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> EncoderVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        // distro builds append "-3ubuntu5" and the like
        let numeric = version_part.split(|c: char| c != '.' && !c.is_ascii_digit()).next().unwrap_or("");
        let mut parts = numeric.split('.').filter(|p| !p.is_empty());

        let major = parts
            .next()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?
            .parse::<u32>()
            .with_context(|| format!("Failed to parse major version from: {}", version_part))?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Ok(EncoderVersion { major, minor, patch })
    }
}

impl std::fmt::Display for EncoderVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Lifecycle of a single encoder invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    NotStarted,
    Running,
    Succeeded,
    Failed(EncodeFailure),
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationState::Succeeded | InvocationState::Failed(_))
    }

    fn advance(self, next: InvocationState) -> InvocationState {
        let legal = matches!(
            (self, next),
            (InvocationState::NotStarted, InvocationState::Running)
                | (InvocationState::NotStarted, InvocationState::Failed(EncodeFailure::SpawnError))
                | (InvocationState::Running, InvocationState::Succeeded)
                | (InvocationState::Running, InvocationState::Failed(_))
        );
        debug_assert!(legal, "illegal invocation transition {:?} -> {:?}", self, next);
        if !legal {
            warn!("Illegal encoder invocation transition {:?} -> {:?}", self, next);
        }
        next
    }
}

/// Everything one encode needs
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub input: &'a Path,
    pub profile: &'a EncodeProfile,
    /// Directory the artifact is written into
    pub workspace: &'a Path,
    /// Source duration, when validation already found it
    pub duration_hint: Option<Duration>,
    /// Wall-clock budget for the whole invocation
    pub deadline: Duration,
}

/// Command builder for generating encoder command lines
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the full encode command line; every format decision comes from the profile
    pub fn build_encode_command(&self, input: &Path, output: &Path, profile: &EncodeProfile) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            // machine-readable progress on stderr, next to the diagnostics
            "-progress".to_string(),
            "pipe:2".to_string(),
            "-nostats".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
        ];
        args.extend(profile.output_args());
        args.push(output.to_string_lossy().to_string());
        args
    }
}

/// Where the artifact of `profile` lands inside a workspace
pub fn output_path(workspace: &Path, profile: &EncodeProfile) -> PathBuf {
    workspace.join(format!("output.{}", profile.container.extension()))
}

/// Supervises encoder child processes
#[derive(Debug, Clone)]
pub struct EncoderSupervisor {
    encoder_bin: PathBuf,
    kill_grace: Duration,
}

enum Exit {
    Status(std::io::Result<std::process::ExitStatus>),
    Interrupted(EncodeFailure),
}

impl EncoderSupervisor {
    pub fn new(encoder_bin: impl Into<PathBuf>, kill_grace: Duration) -> Self {
        Self {
            encoder_bin: encoder_bin.into(),
            kill_grace,
        }
    }

    pub fn encoder_bin(&self) -> &Path {
        &self.encoder_bin
    }

    /// Run `<encoder> -version` and parse the result
    pub async fn detect_version(&self) -> Result<EncoderVersion> {
        let output = Command::new(&self.encoder_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute encoder at: {}", self.encoder_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("Encoder version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from encoder -version"))?;
        EncoderVersion::parse(first_line)
    }

    /// Encode `request.input` into the workspace and return the artifact path.
    ///
    /// `on_progress` receives non-decreasing fractions in `[0, 1]`. The child
    /// is reaped before this returns, whatever the outcome.
    pub async fn run<F>(
        &self,
        request: EncodeRequest<'_>,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<PathBuf, EncodeError>
    where
        F: FnMut(f64) + Send + 'static,
    {
        let output = output_path(request.workspace, request.profile);
        let args = CommandBuilder::new().build_encode_command(request.input, &output, request.profile);
        debug!("Executing encoder: {} {}", self.encoder_bin.display(), args.join(" "));

        let mut state = InvocationState::NotStarted;

        let mut cmd = Command::new(&self.encoder_bin);
        cmd.args(&args)
            .current_dir(request.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                state.advance(InvocationState::Failed(EncodeFailure::SpawnError));
                warn!("❌ Failed to spawn encoder {}: {}", self.encoder_bin.display(), e);
                return Err(EncodeError::SpawnError {
                    binary: self.encoder_bin.clone(),
                    message: e.to_string(),
                });
            }
        };
        state = state.advance(InvocationState::Running);

        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                self.terminate(&mut child).await;
                state.advance(InvocationState::Failed(EncodeFailure::SpawnError));
                return Err(EncodeError::SpawnError {
                    binary: self.encoder_bin.clone(),
                    message: "encoder stderr was not captured".to_string(),
                });
            }
        };
        let mut monitor = tokio::spawn(monitor_stderr(
            stderr,
            ProgressParser::new(request.duration_hint),
            on_progress,
        ));

        let deadline = tokio::time::Instant::now() + request.deadline;
        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            _ = tokio::time::sleep_until(deadline) => Exit::Interrupted(EncodeFailure::Timeout),
            _ = cancel.cancelled() => Exit::Interrupted(EncodeFailure::Cancelled),
        };

        let result = match exit {
            Exit::Status(Ok(status)) => {
                let tail = drain(&mut monitor).await;
                if !status.success() {
                    Err(EncodeError::EncoderFailed {
                        exit_code: status.code(),
                        stderr_tail: tail,
                    })
                } else {
                    match tokio::fs::metadata(&output).await {
                        Ok(meta) if meta.len() > 0 => Ok(output),
                        _ => Err(EncodeError::EncoderFailed {
                            exit_code: status.code(),
                            stderr_tail: format!("{}\nencoder exited cleanly but produced no output", tail),
                        }),
                    }
                }
            }
            Exit::Status(Err(e)) => {
                self.terminate(&mut child).await;
                drain(&mut monitor).await;
                Err(EncodeError::EncoderFailed {
                    exit_code: None,
                    stderr_tail: format!("failed to wait for encoder: {}", e),
                })
            }
            Exit::Interrupted(reason) => {
                match reason {
                    EncodeFailure::Timeout => warn!("⌛ Encoder exceeded its {:?} deadline, stopping it", request.deadline),
                    _ => info!("🛑 Encoder cancelled, stopping it"),
                }
                self.terminate(&mut child).await;
                drain(&mut monitor).await;
                Err(match reason {
                    EncodeFailure::Timeout => EncodeError::Timeout(request.deadline),
                    _ => EncodeError::Cancelled,
                })
            }
        };

        state = state.advance(match &result {
            Ok(_) => InvocationState::Succeeded,
            Err(e) => InvocationState::Failed(e.kind()),
        });
        debug!("Encoder invocation finished: {:?}", state);

        result
    }

    /// SIGTERM, a grace period, then SIGKILL; returns once the child is reaped
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            // id() is None once the child has been reaped
            if let Some(pid) = child.id() {
                match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) => match tokio::time::timeout(self.kill_grace, child.wait()).await {
                        Ok(Ok(status)) => {
                            debug!("Encoder exited after SIGTERM: {}", status);
                            return;
                        }
                        Ok(Err(e)) => warn!("Failed to wait for encoder after SIGTERM: {}", e),
                        Err(_) => warn!("Encoder ignored SIGTERM for {:?}, killing it", self.kill_grace),
                    },
                    Err(e) => debug!("SIGTERM to encoder pid {} failed: {}", pid, e),
                }
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill encoder: {}", e);
        }
    }
}

/// Wait for the stderr reader to finish; a grandchild holding the pipe open cannot stall us
async fn drain(monitor: &mut JoinHandle<String>) -> String {
    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut *monitor).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            warn!("Encoder stderr reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            monitor.abort();
            debug!("Encoder stderr still open after exit, abandoning reader");
            String::new()
        }
    }
}

/// Key/value lines of the `-progress` feed; they never belong in a failure excerpt
fn is_progress_line(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => !key.is_empty() && key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
        None => false,
    }
}

/// Consume the child's stderr: feed the progress parser, keep a short tail for diagnostics
async fn monitor_stderr<R, F>(stderr: R, mut parser: ProgressParser, mut on_progress: F) -> String
where
    R: AsyncRead + Unpin,
    F: FnMut(f64),
{
    let mut reader = BufReader::new(stderr);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match (&mut reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Error reading encoder stderr: {}", e);
                break;
            }
        }

        // classic stats lines are separated by carriage returns
        for segment in buf.split(|b| *b == b'\r' || *b == b'\n') {
            let line = String::from_utf8_lossy(segment);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(fraction) = parser.feed(line) {
                on_progress(fraction);
            }
            if is_progress_line(line) {
                continue;
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }

    Vec::from(tail).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::builtin_profiles;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_version_parsing() {
        let v1 = EncoderVersion::parse("ffmpeg version 8.0 Copyright (c) 2000-2025").unwrap();
        assert_eq!(v1, EncoderVersion { major: 8, minor: 0, patch: 0 });

        let v2 = EncoderVersion::parse("ffmpeg version 6.1.1-3ubuntu5 Copyright").unwrap();
        assert_eq!(v2, EncoderVersion { major: 6, minor: 1, patch: 1 });
        assert_eq!(v2.to_string(), "6.1.1");

        assert!(EncoderVersion::parse("ffmpeg version N/A").is_err());
    }

    #[test]
    fn test_command_line_layout() {
        let profiles = builtin_profiles();
        let profile = &profiles[0];
        let args = CommandBuilder::new().build_encode_command(
            Path::new("/ws/source.mov"),
            Path::new("/ws/output.mp4"),
            profile,
        );

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "/ws/source.mov");
        assert_eq!(args.last().map(String::as_str), Some("/ws/output.mp4"));
        // progress options are global and precede the input
        let progress = args.iter().position(|a| a == "-progress").unwrap();
        assert!(progress < input);
        assert_eq!(args[progress + 1], "pipe:2");
        // profile arguments sit between input and output
        let codec = args.iter().position(|a| a == "-c:v").unwrap();
        assert!(codec > input);
        assert_eq!(args[codec + 1], "libx264");
    }

    #[test]
    fn test_output_path_follows_container() {
        let profiles = builtin_profiles();
        assert_eq!(output_path(Path::new("/ws"), &profiles[0]), PathBuf::from("/ws/output.mp4"));
        assert_eq!(output_path(Path::new("/ws"), &profiles[1]), PathBuf::from("/ws/output.mkv"));
    }

    #[test]
    fn test_progress_lines_are_recognised() {
        assert!(is_progress_line("out_time_us=5000000"));
        assert!(is_progress_line("progress=continue"));
        assert!(!is_progress_line("Error while decoding stream #0:0: Invalid data"));
        assert!(!is_progress_line("[libx264 @ 0x55] crf=23.0"));
    }

    #[test]
    fn test_invocation_state_terminality() {
        assert!(!InvocationState::NotStarted.is_terminal());
        assert!(!InvocationState::Running.is_terminal());
        assert!(InvocationState::Succeeded.is_terminal());
        assert!(InvocationState::Failed(EncodeFailure::Timeout).is_terminal());
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded_and_skips_progress() {
        let mut input = String::new();
        for i in 0..50 {
            input.push_str(&format!("warning {}\nout_time_us={}\n", i, i));
        }
        let tail = monitor_stderr(input.as_bytes(), ProgressParser::new(None), |_| {}).await;
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.last(), Some(&"warning 49"));
        assert!(!tail.contains("out_time_us"));
    }

    #[tokio::test]
    async fn test_carriage_return_stats_drive_progress() {
        let input = "Duration: 00:00:04.00, start: 0.0\nframe=1 time=00:00:01.00 speed=1x\rframe=2 time=00:00:02.00 speed=1x\r";
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor_stderr(input.as_bytes(), ProgressParser::new(None), move |f| sink.lock().unwrap().push(f)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0.25, 0.5]);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::test_support::{process_gone, read_pid, write_script, SUCCESSFUL_ENCODER};
        use std::time::Instant;

        fn request<'a>(input: &'a Path, workspace: &'a Path, profile: &'a EncodeProfile, deadline: Duration) -> EncodeRequest<'a> {
            EncodeRequest {
                input,
                profile,
                workspace,
                duration_hint: None,
                deadline,
            }
        }

        #[tokio::test]
        async fn test_successful_encode_reports_progress() {
            let tmp = tempfile::tempdir().unwrap();
            let encoder = write_script(tmp.path(), "encoder", SUCCESSFUL_ENCODER);
            let input = tmp.path().join("source.mov");
            std::fs::write(&input, b"source").unwrap();
            let profiles = builtin_profiles();
            let profile = &profiles[0];

            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            let artifact = EncoderSupervisor::new(&encoder, Duration::from_secs(1))
                .run(
                    request(&input, tmp.path(), profile, Duration::from_secs(30)),
                    &CancellationToken::new(),
                    move |f| sink.lock().unwrap().push(f),
                )
                .await
                .unwrap();

            assert_eq!(artifact, tmp.path().join("output.mp4"));
            assert_eq!(std::fs::read(&artifact).unwrap(), b"converted");
            let seen = seen.lock().unwrap().clone();
            assert_eq!(seen, vec![0.25, 0.5, 1.0]);
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_encoder_failed() {
            let tmp = tempfile::tempdir().unwrap();
            let encoder = write_script(
                tmp.path(),
                "encoder",
                "echo 'Error while decoding stream #0:0: Invalid data found' >&2\nexit 3",
            );
            let input = tmp.path().join("source.mov");
            std::fs::write(&input, b"source").unwrap();

            let err = EncoderSupervisor::new(&encoder, Duration::from_secs(1))
                .run(request(&input, tmp.path(), &builtin_profiles()[0], Duration::from_secs(30)), &CancellationToken::new(), |_| {})
                .await
                .unwrap_err();

            match err {
                EncodeError::EncoderFailed { exit_code, stderr_tail } => {
                    assert_eq!(exit_code, Some(3));
                    assert!(stderr_tail.contains("Invalid data found"));
                }
                other => panic!("expected EncoderFailed, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_clean_exit_without_output_is_a_failure() {
            let tmp = tempfile::tempdir().unwrap();
            let encoder = write_script(tmp.path(), "encoder", "exit 0");
            let input = tmp.path().join("source.mov");
            std::fs::write(&input, b"source").unwrap();

            let err = EncoderSupervisor::new(&encoder, Duration::from_secs(1))
                .run(request(&input, tmp.path(), &builtin_profiles()[1], Duration::from_secs(30)), &CancellationToken::new(), |_| {})
                .await
                .unwrap_err();
            assert_eq!(err.kind(), EncodeFailure::EncoderFailed);
        }

        #[tokio::test]
        async fn test_missing_binary_is_spawn_error() {
            let tmp = tempfile::tempdir().unwrap();
            let input = tmp.path().join("source.mov");
            std::fs::write(&input, b"source").unwrap();

            let err = EncoderSupervisor::new(tmp.path().join("no-such-encoder"), Duration::from_secs(1))
                .run(request(&input, tmp.path(), &builtin_profiles()[0], Duration::from_secs(30)), &CancellationToken::new(), |_| {})
                .await
                .unwrap_err();
            assert!(matches!(err, EncodeError::SpawnError { .. }));
        }

        #[tokio::test]
        async fn test_deadline_kills_the_encoder() {
            let tmp = tempfile::tempdir().unwrap();
            let pidfile = tmp.path().join("encoder.pid");
            let encoder = write_script(
                tmp.path(),
                "encoder",
                &format!("echo $$ > '{}'\nexec sleep 30", pidfile.display()),
            );
            let input = tmp.path().join("source.mov");
            std::fs::write(&input, b"source").unwrap();

            let started = Instant::now();
            let err = EncoderSupervisor::new(&encoder, Duration::from_secs(2))
                .run(request(&input, tmp.path(), &builtin_profiles()[0], Duration::from_millis(500)), &CancellationToken::new(), |_| {})
                .await
                .unwrap_err();

            assert!(matches!(err, EncodeError::Timeout(_)));
            assert!(started.elapsed() < Duration::from_secs(10));
            let pid = read_pid(&pidfile).await;
            assert!(process_gone(pid), "encoder pid {} still alive", pid);
        }

        #[tokio::test]
        async fn test_cancel_stops_an_encoder_that_ignores_sigterm() {
            let tmp = tempfile::tempdir().unwrap();
            let pidfile = tmp.path().join("encoder.pid");
            let encoder = write_script(
                tmp.path(),
                "encoder",
                &format!("trap '' TERM\necho $$ > '{}'\nwhile :; do sleep 0.1; done", pidfile.display()),
            );
            let input = tmp.path().join("source.mov");
            std::fs::write(&input, b"source").unwrap();

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            let pidfile_wait = pidfile.clone();
            tokio::spawn(async move {
                read_pid(&pidfile_wait).await;
                trigger.cancel();
            });

            let err = EncoderSupervisor::new(&encoder, Duration::from_millis(300))
                .run(request(&input, tmp.path(), &builtin_profiles()[0], Duration::from_secs(60)), &cancel, |_| {})
                .await
                .unwrap_err();

            assert!(matches!(err, EncodeError::Cancelled));
            let pid = read_pid(&pidfile).await;
            assert!(process_gone(pid), "encoder pid {} still alive", pid);
        }
    }
}
