use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{PipelineError, PipelineResult};

/// Extension used when the server reports a file without one.
pub const FALLBACK_EXTENSION: &str = ".mp4";

/// Picks the local file name for a downloaded artifact.
///
/// Implementations are not required to be safe when several callers write
/// into the same directory with the same extension at once; callers that
/// need that must serialize per (directory, extension) pair.
pub trait ArtifactNamer: Send + Sync {
    fn assign(&self, destination_dir: &Path, remote_filename: &str) -> PipelineResult<String>;
}

/// Extension of `remote_filename` including the leading dot, or `.mp4`.
pub fn extension_of(remote_filename: &str) -> String {
    Path::new(remote_filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

/// Numbers files `1.mp4`, `2.mp4`, ... by scanning the directory each call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSequenceNamer;

impl DiskSequenceNamer {
    pub fn new() -> Self {
        Self
    }

    pub fn highest_existing(dir: &Path, extension: &str) -> PipelineResult<u64> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(PipelineError::io(dir, err)),
        };

        let mut highest = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(number) = sequence_number(name, extension) {
                highest = highest.max(number);
            }
        }
        Ok(highest)
    }
}

impl ArtifactNamer for DiskSequenceNamer {
    fn assign(&self, destination_dir: &Path, remote_filename: &str) -> PipelineResult<String> {
        let extension = extension_of(remote_filename);
        let highest = Self::highest_existing(destination_dir, &extension)?;
        Ok(format!("{}{extension}", highest + 1))
    }
}

fn sequence_number(name: &str, extension: &str) -> Option<u64> {
    let stem = name.strip_suffix(extension)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// In-memory counter per (directory, extension); never touches the disk.
#[derive(Debug, Default)]
pub struct MemorySequenceNamer {
    counters: Mutex<HashMap<(PathBuf, String), u64>>,
}

impl MemorySequenceNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering after `last` for the given pair.
    pub fn seed(&self, dir: &Path, extension: &str, last: u64) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.insert((dir.to_path_buf(), extension.to_string()), last);
    }
}

impl ArtifactNamer for MemorySequenceNamer {
    fn assign(&self, destination_dir: &Path, remote_filename: &str) -> PipelineResult<String> {
        let extension = extension_of(remote_filename);
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = counters
            .entry((destination_dir.to_path_buf(), extension.clone()))
            .or_insert(0);
        *counter += 1;
        Ok(format!("{counter}{extension}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_directory_starts_at_one() {
        let dir = tempdir().unwrap();
        let name = DiskSequenceNamer::new()
            .assign(dir.path(), "ComfyUI_00001_.mp4")
            .unwrap();
        assert_eq!(name, "1.mp4");
    }

    #[test]
    fn next_number_follows_highest_existing() {
        let dir = tempdir().unwrap();
        for existing in ["1.mp4", "2.mp4", "7.mp4", "abc.mp4", "9.png", "12.mp4.part"] {
            fs::write(dir.path().join(existing), b"x").unwrap();
        }

        let namer = DiskSequenceNamer::new();
        assert_eq!(namer.assign(dir.path(), "out.mp4").unwrap(), "8.mp4");
        assert_eq!(namer.assign(dir.path(), "frame.png").unwrap(), "10.png");
        assert_eq!(namer.assign(dir.path(), "anim.gif").unwrap(), "1.gif");
    }

    #[test]
    fn non_numeric_names_are_left_in_place() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("abc.mp4"), b"x").unwrap();
        fs::write(dir.path().join("-3.mp4"), b"x").unwrap();

        let name = DiskSequenceNamer::new().assign(dir.path(), "a.mp4").unwrap();
        assert_eq!(name, "1.mp4");
        assert!(dir.path().join("abc.mp4").exists());
        assert!(dir.path().join("-3.mp4").exists());
    }

    #[test]
    fn missing_extension_falls_back_to_mp4() {
        assert_eq!(extension_of("render_output"), ".mp4");
        assert_eq!(extension_of("frame.PNG"), ".PNG");
        assert_eq!(extension_of("clip.final.webm"), ".webm");

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("4.mp4"), b"x").unwrap();
        let name = DiskSequenceNamer::new()
            .assign(dir.path(), "render_output")
            .unwrap();
        assert_eq!(name, "5.mp4");
    }

    #[test]
    fn missing_directory_counts_as_empty() {
        let dir = tempdir().unwrap();
        let name = DiskSequenceNamer::new()
            .assign(&dir.path().join("not-yet"), "a.mp4")
            .unwrap();
        assert_eq!(name, "1.mp4");
    }

    #[test]
    fn memory_namer_counts_per_directory_and_extension() {
        let namer = MemorySequenceNamer::new();
        let a = Path::new("/virtual/a");
        let b = Path::new("/virtual/b");

        assert_eq!(namer.assign(a, "x.mp4").unwrap(), "1.mp4");
        assert_eq!(namer.assign(a, "y.mp4").unwrap(), "2.mp4");
        assert_eq!(namer.assign(a, "y.png").unwrap(), "1.png");
        assert_eq!(namer.assign(b, "z.mp4").unwrap(), "1.mp4");

        namer.seed(b, ".mp4", 7);
        assert_eq!(namer.assign(b, "z.mp4").unwrap(), "8.mp4");
    }
}
