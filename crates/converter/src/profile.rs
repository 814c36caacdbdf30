//! Encode profiles and the registry that resolves them by name.
//!
//! Every encoder argument that depends on the target format is derived here
//! from profile fields, so the supervisor never branches on profile identity.

use std::collections::HashSet;
use serde::{Deserialize, Serialize};
use crate::error::UnknownProfile;

/// Output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mkv,
}

impl Container {
    /// File extension for the container
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
        }
    }

    /// Muxer options the container needs
    fn muxer_args(&self) -> Vec<String> {
        match self {
            // moov atom up front so the result can stream before it is fully downloaded
            Container::Mp4 => vec!["-movflags".to_string(), "+faststart".to_string()],
            Container::Mkv => Vec::new(),
        }
    }
}

/// Which audio/subtitle tracks survive the conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackPolicy {
    /// First video, first audio and first subtitle stream only
    PreserveDefaultOnly,
    /// First video plus every audio and subtitle stream
    PreserveAll,
}

impl TrackPolicy {
    /// `-map` arguments implementing the policy; audio and subtitles are optional
    pub fn map_args(&self) -> Vec<String> {
        let selectors: &[&str] = match self {
            TrackPolicy::PreserveDefaultOnly => &["0:v:0", "0:a:0?", "0:s:0?"],
            TrackPolicy::PreserveAll => &["0:v:0", "0:a?", "0:s?"],
        };
        selectors
            .iter()
            .flat_map(|s| ["-map".to_string(), s.to_string()])
            .collect()
    }
}

/// Video rate control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Constant rate factor
    Crf(u8),
    /// Target bitrate in ffmpeg notation, e.g. "2M"
    Bitrate(String),
}

impl Quality {
    fn args(&self) -> Vec<String> {
        match self {
            Quality::Crf(crf) => vec!["-crf".to_string(), crf.to_string()],
            Quality::Bitrate(rate) => vec!["-b:v".to_string(), rate.clone()],
        }
    }
}

/// Immutable bundle of encoder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeProfile {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub container: Container,
    pub video_codec: String,
    pub audio_codec: String,
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    /// Subtitle codec; `None` lets the muxer pick its default
    #[serde(default)]
    pub subtitle_codec: Option<String>,
    pub quality: Quality,
    #[serde(default)]
    pub preset: Option<String>,
    pub track_policy: TrackPolicy,
    /// Maximum output height; taller sources are scaled down keeping aspect ratio
    #[serde(default)]
    pub resolution_cap: Option<u32>,
}

impl EncodeProfile {
    /// Whether `name` designates this profile (case-insensitive, aliases included)
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim();
        self.name.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Output-side encoder arguments: stream selection, codecs, quality, filters, muxer flags
    pub fn output_args(&self) -> Vec<String> {
        let mut args = self.track_policy.map_args();

        args.push("-c:v".to_string());
        args.push(self.video_codec.clone());
        args.extend(self.quality.args());

        if let Some(preset) = &self.preset {
            args.push("-preset".to_string());
            args.push(preset.clone());
        }

        if let Some(cap) = self.resolution_cap {
            // never upscale; -2 keeps the width even
            args.push("-vf".to_string());
            args.push(format!("scale=-2:'min({},ih)'", cap));
        }

        args.push("-c:a".to_string());
        args.push(self.audio_codec.clone());
        if let Some(bitrate) = &self.audio_bitrate {
            args.push("-b:a".to_string());
            args.push(bitrate.clone());
        }

        if let Some(codec) = &self.subtitle_codec {
            args.push("-c:s".to_string());
            args.push(codec.clone());
        }

        args.extend(self.container.muxer_args());
        args
    }

    /// Human-readable one-line summary
    pub fn describe(&self) -> String {
        let quality = match &self.quality {
            Quality::Crf(crf) => format!("CRF {}", crf),
            Quality::Bitrate(rate) => format!("{} video", rate),
        };
        let mut parts = vec![
            self.container.extension().to_uppercase(),
            format!("{} + {}", self.video_codec, self.audio_codec),
            quality,
        ];
        if let Some(cap) = self.resolution_cap {
            parts.push(format!("max {}p", cap));
        }
        parts.push(match self.track_policy {
            TrackPolicy::PreserveDefaultOnly => "default tracks".to_string(),
            TrackPolicy::PreserveAll => "all tracks".to_string(),
        });
        parts.join(", ")
    }
}

/// The two profiles offered out of the box
pub fn builtin_profiles() -> Vec<EncodeProfile> {
    vec![
        EncodeProfile {
            name: "MP4/H.264".to_string(),
            aliases: vec!["mp4".to_string(), "h264".to_string()],
            container: Container::Mp4,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: None,
            subtitle_codec: Some("mov_text".to_string()),
            quality: Quality::Crf(23),
            preset: Some("medium".to_string()),
            track_policy: TrackPolicy::PreserveDefaultOnly,
            resolution_cap: None,
        },
        EncodeProfile {
            name: "MKV/H.265".to_string(),
            aliases: vec!["mkv".to_string(), "h265".to_string(), "hevc".to_string()],
            container: Container::Mkv,
            video_codec: "libx265".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: Some("96k".to_string()),
            subtitle_codec: Some("copy".to_string()),
            quality: Quality::Crf(28),
            preset: Some("medium".to_string()),
            track_policy: TrackPolicy::PreserveAll,
            resolution_cap: Some(480),
        },
    ]
}

/// Read-only set of profiles, built once at startup
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<EncodeProfile>,
}

impl ProfileRegistry {
    /// Build a registry, rejecting names or aliases that collide
    pub fn new(profiles: Vec<EncodeProfile>) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        for profile in &profiles {
            for key in std::iter::once(&profile.name).chain(profile.aliases.iter()) {
                if !seen.insert(key.to_ascii_lowercase()) {
                    anyhow::bail!("duplicate profile name or alias: {}", key);
                }
            }
        }
        Ok(Self { profiles })
    }

    pub fn builtin() -> Self {
        Self {
            profiles: builtin_profiles(),
        }
    }

    /// Look a profile up by name or alias
    pub fn resolve(&self, name: &str) -> Result<&EncodeProfile, UnknownProfile> {
        self.profiles
            .iter()
            .find(|p| p.matches(name))
            .ok_or_else(|| UnknownProfile(name.to_string()))
    }

    pub fn list(&self) -> &[EncodeProfile] {
        &self.profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(args: &[String], flag: &str) -> Option<usize> {
        args.iter().position(|a| a == flag)
    }

    #[test]
    fn test_resolve_by_name_and_alias() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.resolve("MP4/H.264").unwrap().container, Container::Mp4);
        assert_eq!(registry.resolve("mkv/h.265").unwrap().container, Container::Mkv);
        assert_eq!(registry.resolve(" HEVC ").unwrap().name, "MKV/H.265");
    }

    #[test]
    fn test_unknown_profile() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.resolve("webm/vp9"), Err(UnknownProfile("webm/vp9".to_string())));
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let mut profiles = builtin_profiles();
        profiles[1].aliases.push("MP4".to_string());
        assert!(ProfileRegistry::new(profiles).is_err());
    }

    #[test]
    fn test_mp4_arguments() {
        let registry = ProfileRegistry::builtin();
        let args = registry.resolve("mp4").unwrap().output_args();

        let joined = args.join(" ");
        assert!(joined.contains("-map 0:v:0 -map 0:a:0? -map 0:s:0?"));
        assert!(joined.contains("-c:v libx264 -crf 23 -preset medium"));
        assert!(joined.contains("-c:s mov_text"));
        assert!(joined.ends_with("-movflags +faststart"));
        assert!(position(&args, "-vf").is_none());
    }

    #[test]
    fn test_mkv_arguments() {
        let registry = ProfileRegistry::builtin();
        let args = registry.resolve("mkv").unwrap().output_args();

        let joined = args.join(" ");
        assert!(joined.contains("-map 0:v:0 -map 0:a? -map 0:s?"));
        assert!(joined.contains("-c:v libx265 -crf 28"));
        assert!(joined.contains("-c:a aac -b:a 96k"));
        let vf = position(&args, "-vf").expect("resolution cap adds a scale filter");
        assert_eq!(args[vf + 1], "scale=-2:'min(480,ih)'");
        assert!(position(&args, "-movflags").is_none());
    }

    #[test]
    fn test_bitrate_quality() {
        let mut profile = builtin_profiles().remove(0);
        profile.quality = Quality::Bitrate("2M".to_string());
        let args = profile.output_args();
        let idx = position(&args, "-b:v").unwrap();
        assert_eq!(args[idx + 1], "2M");
        assert!(position(&args, "-crf").is_none());
    }

    #[test]
    fn test_profiles_deserialize_from_toml() {
        let toml_src = r#"
            name = "WEBM/VP9"
            container = "mkv"
            video_codec = "libvpx-vp9"
            audio_codec = "libopus"
            quality = { bitrate = "1M" }
            track_policy = "preserve_all"
        "#;
        let profile: EncodeProfile = toml::from_str(toml_src).unwrap();
        assert_eq!(profile.quality, Quality::Bitrate("1M".to_string()));
        assert_eq!(profile.track_policy, TrackPolicy::PreserveAll);
        assert!(profile.aliases.is_empty());
    }
}
