use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use crate::profile::{builtin_profiles, EncodeProfile};

/// Configuration for the conversion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Download/upload ceiling in bytes (default 2GB)
    pub max_file_size_bytes: u64,
    /// Base directory under which per-job workspaces are created
    pub scratch_root: PathBuf,
    /// Admission-control limit: jobs allowed past `Queued` at once
    pub max_concurrent_jobs: usize,
    /// Optional per-owner active-job limit, on top of the global limit
    pub max_jobs_per_owner: Option<usize>,
    /// Per-job encoder deadline in seconds
    pub encoder_timeout_secs: u64,
    /// Path to the encoder binary
    pub encoder_bin: PathBuf,
    /// Path to ffprobe; `None` disables probing during validation
    pub ffprobe_bin: Option<PathBuf>,
    /// Seconds between SIGTERM and SIGKILL when stopping the encoder
    pub kill_grace_secs: u64,
    /// Minimum free bytes required on the scratch volume before allocating a workspace
    pub min_free_bytes: u64,
    /// Chunk size used when streaming payloads
    pub transfer_chunk_bytes: usize,
    /// Minimum interval between intermediate progress callbacks
    pub progress_interval_ms: u64,
    /// Capacity of the per-job progress queue; intermediate updates are dropped when full
    pub progress_queue_capacity: usize,
    /// Encode profiles, loaded once at startup
    pub profiles: Vec<EncodeProfile>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            max_file_size_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            scratch_root: PathBuf::from("./temp"),
            max_concurrent_jobs: 2,
            max_jobs_per_owner: None,
            encoder_timeout_secs: 60 * 60,
            encoder_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: Some(PathBuf::from("ffprobe")),
            kill_grace_secs: 5,
            min_free_bytes: 1024 * 1024 * 1024, // 1GB
            transfer_chunk_bytes: 256 * 1024,
            progress_interval_ms: 500,
            progress_queue_capacity: 16,
            profiles: builtin_profiles(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                log::warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TEMP_DIR") {
            self.scratch_root = PathBuf::from(dir);
        }
        if let Some(size) = lookup("MAX_FILE_SIZE") {
            self.max_file_size_bytes = size.trim().parse()
                .with_context(|| format!("MAX_FILE_SIZE is not a byte count: {}", size))?;
        }
        if let Some(bin) = lookup("FFMPEG_PATH") {
            self.encoder_bin = PathBuf::from(bin);
        }
        if let Some(bin) = lookup("FFPROBE_PATH") {
            self.ffprobe_bin = if bin.trim().is_empty() { None } else { Some(PathBuf::from(bin)) };
        }
        if let Some(limit) = lookup("MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = limit.trim().parse()
                .with_context(|| format!("MAX_CONCURRENT_JOBS is not a number: {}", limit))?;
        }
        if let Some(secs) = lookup("ENCODER_TIMEOUT_SECS") {
            self.encoder_timeout_secs = secs.trim().parse()
                .with_context(|| format!("ENCODER_TIMEOUT_SECS is not a number: {}", secs))?;
        }
        Ok(())
    }

    /// Check the configuration and make sure the scratch root exists
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be at least 1");
        }
        if self.max_jobs_per_owner == Some(0) {
            bail!("max_jobs_per_owner must be at least 1 when set");
        }
        if self.max_file_size_bytes == 0 {
            bail!("max_file_size_bytes must be greater than zero");
        }
        if self.encoder_timeout_secs == 0 {
            bail!("encoder_timeout_secs must be greater than zero");
        }
        if self.transfer_chunk_bytes == 0 {
            bail!("transfer_chunk_bytes must be greater than zero");
        }
        if self.profiles.is_empty() {
            bail!("at least one encode profile must be configured");
        }

        std::fs::create_dir_all(&self.scratch_root)
            .with_context(|| format!("Failed to create scratch root: {}", self.scratch_root.display()))?;

        Ok(())
    }

    pub fn encoder_timeout(&self) -> Duration {
        Duration::from_secs(self.encoder_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = ConverterConfig::default();
        assert_eq!(cfg.max_file_size_bytes, 2_147_483_648);
        assert_eq!(cfg.scratch_root, PathBuf::from("./temp"));
        assert_eq!(cfg.encoder_bin, PathBuf::from("ffmpeg"));
        assert_eq!(cfg.profiles.len(), 2);
    }

    #[test]
    fn test_load_toml_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convertd.toml");
        std::fs::write(&path, "max_concurrent_jobs = 4\nencoder_timeout_secs = 90\n").unwrap();

        let cfg = ConverterConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.max_concurrent_jobs, 4);
        assert_eq!(cfg.encoder_timeout(), Duration::from_secs(90));
        // untouched fields keep their defaults
        assert_eq!(cfg.max_file_size_bytes, 2_147_483_648);
        assert_eq!(cfg.profiles.len(), 2);
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convertd.json");
        std::fs::write(&path, r#"{"max_file_size_bytes": 1024, "ffprobe_bin": null}"#).unwrap();

        let cfg = ConverterConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.max_file_size_bytes, 1024);
        assert!(cfg.ffprobe_bin.is_none());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = ConverterConfig::load_config(Some(Path::new("/nonexistent/convertd.toml"))).unwrap();
        assert_eq!(cfg.max_concurrent_jobs, 2);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TEMP_DIR", "/var/tmp/convertd"),
            ("MAX_FILE_SIZE", "1000"),
            ("FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg"),
            ("FFPROBE_PATH", ""),
            ("MAX_CONCURRENT_JOBS", "3"),
        ]
        .into_iter()
        .collect();

        let mut cfg = ConverterConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.scratch_root, PathBuf::from("/var/tmp/convertd"));
        assert_eq!(cfg.max_file_size_bytes, 1000);
        assert_eq!(cfg.encoder_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert!(cfg.ffprobe_bin.is_none());
        assert_eq!(cfg.max_concurrent_jobs, 3);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut cfg = ConverterConfig::default();
        let result = cfg.apply_overrides(|k| (k == "MAX_FILE_SIZE").then(|| "two gigs".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConverterConfig {
            scratch_root: dir.path().join("scratch"),
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_creates_scratch_root() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConverterConfig {
            scratch_root: dir.path().join("scratch"),
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert!(cfg.scratch_root.is_dir());
    }
}
