//! Capture storage
//!
//! Writes each transferred file's raw capture as a text file with one
//! uppercase hex line per chunk frame.

use crate::infrastructure::bluetooth::file_transfer::{CaptureSink, FileCapture};
use anyhow::Context;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct DirectoryCaptureStore {
    dir: PathBuf,
}

impl DirectoryCaptureStore {
    /// Store rooted at `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<timestamp>_<index>_<name>.hex`
    fn file_name(capture: &FileCapture) -> String {
        format!(
            "{}_{:02}_{}.hex",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            capture.index,
            sanitize(&capture.header.filename)
        )
    }
}

impl CaptureSink for DirectoryCaptureStore {
    fn store(&self, capture: &FileCapture) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating capture directory {}", self.dir.display()))?;

        let path = self.dir.join(Self::file_name(capture));
        let mut file = fs::File::create(&path)
            .with_context(|| format!("creating capture file {}", path.display()))?;
        for line in &capture.frames {
            writeln!(file, "{}", line)?;
        }
        file.flush()?;

        info!("Stored {} frame(s) in {}", capture.frames.len(), path.display());
        Ok(())
    }
}

/// Filesystem-safe rendering of raw filename bytes
fn sanitize(raw: &[u8]) -> String {
    let name: String = String::from_utf8_lossy(raw)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim_matches('.');
    if name.is_empty() {
        "unnamed".to_string()
    } else {
        name.to_string()
    }
}
