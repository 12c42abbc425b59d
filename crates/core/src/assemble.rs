use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::media::{manifest_line, MediaToolkit};

pub const MANIFEST_FILE_NAME: &str = "filelist.txt";
pub const TRIMMED_PREFIX: &str = "temp_cut_";
/// Directory entries shown when narration lookup misses.
const AUDIO_LISTING_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssemblyOptions {
    pub video_extension: String,
    /// Tried in order; the first existing narration file wins.
    pub audio_extensions: Vec<String>,
    /// Narration lives under `<voice_root>/<project>/<segment>.<ext>`.
    pub voice_root: PathBuf,
    /// Directory component preceding the project name in segment paths.
    pub project_marker: String,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            video_extension: ".mp4".to_string(),
            audio_extensions: [".mp3", ".wav", ".m4a", ".aac", ".ogg", ".flac"]
                .map(String::from)
                .to_vec(),
            voice_root: PathBuf::from("out").join("voice"),
            project_marker: "tmp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NoAudio,
    UnusableDuration,
    TrimFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentSource {
    Trimmed { audio: PathBuf, seconds: f64 },
    Original(FallbackReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSegment {
    pub video: PathBuf,
    /// File actually handed to concat.
    pub path: PathBuf,
    pub source: SegmentSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub segments: Vec<PlannedSegment>,
}

/// Files removed when the guard drops, whatever path the assembly took.
struct ScratchFiles {
    paths: Vec<PathBuf>,
}

impl ScratchFiles {
    fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed scratch file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove scratch file")
                }
            }
        }
    }
}

pub struct SegmentAssembler<M> {
    toolkit: M,
    options: AssemblyOptions,
}

impl<M: MediaToolkit> SegmentAssembler<M> {
    pub fn new(toolkit: M, options: AssemblyOptions) -> Self {
        Self { toolkit, options }
    }

    pub fn assemble(&self, input_dir: &Path, output_file: &Path) -> PipelineResult<PathBuf> {
        self.assemble_with_report(input_dir, output_file)
            .map(|report| report.output)
    }

    pub fn assemble_with_report(
        &self,
        input_dir: &Path,
        output_file: &Path,
    ) -> PipelineResult<AssemblyReport> {
        let videos = self.list_videos(input_dir)?;
        info!(
            input_dir = %input_dir.display(),
            count = videos.len(),
            "assembling video segments"
        );

        let mut scratch = ScratchFiles::new();
        let segments = videos
            .iter()
            .map(|video| self.prepare_segment(video, &mut scratch))
            .collect::<PipelineResult<Vec<_>>>()?;

        let manifest = input_dir.join(MANIFEST_FILE_NAME);
        scratch.track(manifest.clone());
        let mut listing = Vec::new();
        for segment in &segments {
            let absolute = std::path::absolute(&segment.path)
                .map_err(|err| PipelineError::io(&segment.path, err))?;
            listing.extend(manifest_line(&absolute));
        }
        fs::write(&manifest, listing).map_err(|err| PipelineError::io(&manifest, err))?;

        if let Some(parent) = output_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
            }
        }

        info!(
            segments = segments.len(),
            output = %output_file.display(),
            "concatenating segments"
        );
        self.toolkit
            .concat(&manifest, output_file)
            .map_err(|err| match err {
                PipelineError::ConcatFailure { .. } => err,
                other => PipelineError::ConcatFailure {
                    output: output_file.to_path_buf(),
                    message: other.to_string(),
                },
            })?;
        info!(output = %output_file.display(), "merged video written");

        Ok(AssemblyReport {
            output: output_file.to_path_buf(),
            segments,
        })
    }

    /// Segment files in the directory, sorted by file name.
    pub fn list_videos(&self, input_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        if !input_dir.is_dir() {
            return Err(PipelineError::NotFound(input_dir.to_path_buf()));
        }

        let extension = self.options.video_extension.as_bytes();
        let mut names: Vec<OsString> = Vec::new();
        for entry in fs::read_dir(input_dir).map_err(|err| PipelineError::io(input_dir, err))? {
            let entry = entry.map_err(|err| PipelineError::io(input_dir, err))?;
            let name = entry.file_name();
            if name.as_encoded_bytes().ends_with(extension) && entry.path().is_file() {
                names.push(name);
            }
        }

        if names.is_empty() {
            return Err(PipelineError::EmptyInput {
                dir: input_dir.to_path_buf(),
                extension: self.options.video_extension.clone(),
            });
        }

        names.sort();
        Ok(names.into_iter().map(|name| input_dir.join(name)).collect())
    }

    /// Component after the project marker in the video's directory, else the
    /// video's own base name.
    pub fn project_name(&self, video: &Path) -> String {
        let parts: Vec<&str> = video
            .parent()
            .map(|dir| {
                dir.components()
                    .filter_map(|component| match component {
                        Component::Normal(part) => part.to_str(),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        parts
            .iter()
            .position(|part| *part == self.options.project_marker)
            .and_then(|idx| parts.get(idx + 1))
            .map(|part| part.to_string())
            .unwrap_or_else(|| base_name(video))
    }

    pub fn find_audio(&self, video: &Path) -> Option<PathBuf> {
        let project = self.project_name(video);
        let audio_dir = self.options.voice_root.join(&project);
        let base = base_name(video);

        let found = self
            .options
            .audio_extensions
            .iter()
            .map(|ext| audio_dir.join(format!("{base}{ext}")))
            .find(|candidate| candidate.is_file());

        if found.is_none() {
            debug!(
                project = %project,
                audio_dir = %audio_dir.display(),
                dir_exists = audio_dir.is_dir(),
                audio_files = ?sample_entries(&audio_dir, AUDIO_LISTING_LIMIT),
                "no narration audio matched segment"
            );
        }
        found
    }

    fn prepare_segment(
        &self,
        video: &Path,
        scratch: &mut ScratchFiles,
    ) -> PipelineResult<PlannedSegment> {
        let original = |reason| PlannedSegment {
            video: video.to_path_buf(),
            path: video.to_path_buf(),
            source: SegmentSource::Original(reason),
        };

        let Some(audio) = self.find_audio(video) else {
            info!(video = %video.display(), "no audio match; using original segment");
            return Ok(original(FallbackReason::NoAudio));
        };

        let seconds = match self.toolkit.probe_duration(&audio) {
            Ok(seconds) if seconds > 0.0 => seconds,
            Ok(seconds) => {
                warn!(audio = %audio.display(), seconds, "non-positive audio duration; using original segment");
                return Ok(original(FallbackReason::UnusableDuration));
            }
            Err(err) if err.is_segment_local() => {
                warn!(audio = %audio.display(), error = %err, "could not read audio duration; using original segment");
                return Ok(original(FallbackReason::UnusableDuration));
            }
            Err(err) => return Err(err),
        };

        let mut trimmed_name = OsString::from(TRIMMED_PREFIX);
        trimmed_name.push(video.file_name().unwrap_or_default());
        let trimmed = video.with_file_name(trimmed_name);
        scratch.track(trimmed.clone());

        match self.toolkit.trim(video, &trimmed, seconds) {
            Ok(()) => {
                info!(video = %video.display(), seconds, "trimmed segment to narration length");
                Ok(PlannedSegment {
                    video: video.to_path_buf(),
                    path: trimmed,
                    source: SegmentSource::Trimmed { audio, seconds },
                })
            }
            Err(err) if err.is_segment_local() => {
                warn!(video = %video.display(), error = %err, "trim failed; using original segment");
                Ok(original(FallbackReason::TrimFailed))
            }
            Err(err) => Err(err),
        }
    }
}

/// Up to `limit` file names from `dir`, sorted; empty when it cannot be read.
fn sample_entries(dir: &Path, limit: usize) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names.truncate(limit);
    names
}

fn base_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
