//! Collection Directory Manager
//!
//! Allocates the output tree for one run:
//!
//! ```text
//! <output_path>/D20260114-T093012/
//! ├── logs/
//! ├── images/<camera_id>/     (separate mode; images/ in combined mode)
//! └── video/<camera_id>/      (separate mode; video/ in combined mode)
//! ```
//!
//! The directory name is the run start time. If it already exists a numeric
//! suffix is appended so runs never share a directory.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::OutputMode;
use crate::error::{AppResult, DaqError};

/// Format of the run directory name.
pub const RUN_DIR_FORMAT: &str = "D%Y%m%d-T%H%M%S";

/// Paths of one run's output tree.
#[derive(Debug, Clone)]
pub struct CollectionLayout {
    root: PathBuf,
    logs: PathBuf,
    images: HashMap<String, PathBuf>,
    video: HashMap<String, PathBuf>,
}

impl CollectionLayout {
    /// Create the run directory and every subdirectory.
    ///
    /// Any failure is reported as `DaqError::OutputUnwritable`.
    pub fn create(
        output_path: &Path,
        start: DateTime<Utc>,
        mode: OutputMode,
        camera_ids: &[String],
    ) -> AppResult<Self> {
        let unwritable =
            |path: &Path, e: std::io::Error| DaqError::OutputUnwritable(format!("{}: {}", path.display(), e));

        fs::create_dir_all(output_path).map_err(|e| unwritable(output_path, e))?;

        let base = start.format(RUN_DIR_FORMAT).to_string();
        let root = unique_dir(output_path, &base).map_err(|e| unwritable(output_path, e))?;

        let logs = root.join("logs");
        let mut images = HashMap::new();
        let mut video = HashMap::new();
        for id in camera_ids {
            let (img, vid) = match mode {
                OutputMode::Separate => (root.join("images").join(id), root.join("video").join(id)),
                OutputMode::Combined => (root.join("images"), root.join("video")),
            };
            images.insert(id.clone(), img);
            video.insert(id.clone(), vid);
        }

        for dir in std::iter::once(&logs).chain(images.values()).chain(video.values()) {
            fs::create_dir_all(dir).map_err(|e| unwritable(dir, e))?;
        }

        info!(root = %root.display(), ?mode, "Created collection directory");
        Ok(Self {
            root,
            logs,
            images,
            video,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs
    }

    /// Still image directory for a camera.
    pub fn images_dir(&self, camera_id: &str) -> Option<&Path> {
        self.images.get(camera_id).map(PathBuf::as_path)
    }

    /// Video directory for a camera.
    pub fn video_dir(&self, camera_id: &str) -> Option<&Path> {
        self.video.get(camera_id).map(PathBuf::as_path)
    }
}

/// Create `parent/base`, or `parent/base_N` if taken, atomically.
fn unique_dir(parent: &Path, base: &str) -> std::io::Result<PathBuf> {
    let mut candidate = parent.join(base);
    let mut n = 1;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                candidate = parent.join(format!("{}_{}", base, n));
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Still image file name for a bracket.
pub fn still_file_name(sequence_number: u64, camera_id: &str, bracket: usize, ext: &str) -> String {
    format!("{:08}_{}_b{:02}.{}", sequence_number, camera_id, bracket, ext)
}

/// HDR merge output file name.
pub fn hdr_file_name(sequence_number: u64, camera_id: &str, ext: &str) -> String {
    format!(
        "{:08}_{}_hdr.{}",
        sequence_number,
        camera_id,
        ext.trim_start_matches('.')
    )
}

/// Video part file name.
pub fn video_file_name(camera_id: &str, part: u32, ext: &str) -> String {
    format!("{}_{:04}.{}", camera_id, part, ext.trim_start_matches('.'))
}
