use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use converter::VIDEO_EXTENSIONS;
use log::{debug, info, warn};
use walkdir::WalkDir;

/// A file ready to be submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub path: PathBuf,
    pub size: u64,
}

/// Watches a directory for video files that have finished copying.
///
/// A file becomes an arrival once its size is unchanged between two
/// consecutive polls; each path is handed out once.
#[derive(Debug)]
pub struct Inbox {
    root: PathBuf,
    last_sizes: HashMap<PathBuf, u64>,
    submitted: HashSet<PathBuf>,
}

impl Inbox {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).with_context(|| format!("Failed to create inbox: {}", root.display()))?;
        Ok(Self {
            root,
            last_sizes: HashMap::new(),
            submitted: HashSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan once and return the files that became stable since the previous scan
    pub fn poll(&mut self) -> Vec<Arrival> {
        let mut seen = HashMap::new();
        let mut arrivals = Vec::new();

        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading inbox entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() || !is_video(path) || self.submitted.contains(path) {
                continue;
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    debug!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };

            match self.last_sizes.get(path) {
                Some(previous) if *previous == size && size > 0 => {
                    info!("📥 New file in inbox: {} ({})", path.display(), humansize::format_size(size, humansize::DECIMAL));
                    self.submitted.insert(path.to_path_buf());
                    arrivals.push(Arrival {
                        path: path.to_path_buf(),
                        size,
                    });
                }
                Some(_) => debug!("Still copying: {}", path.display()),
                None => debug!("Found media file: {}", path.display()),
            }
            seen.insert(path.to_path_buf(), size);
        }

        // forget files that disappeared; a file re-added under the same name is new
        self.submitted.retain(|p| p.exists());
        self.last_sizes = seen;
        arrivals
    }
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| VIDEO_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}
