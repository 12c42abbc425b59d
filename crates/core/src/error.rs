//! Error type shared by the render client, the namer and the assembler.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid render server URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client")]
    HttpClient(#[source] reqwest::Error),

    #[error("upload of {} failed: {message}", path.display())]
    Upload { path: PathBuf, message: String },

    #[error("job submission failed: {0}")]
    Submit(String),

    #[error("history poll for job {job_id} failed: {message}")]
    Poll { job_id: String, message: String },

    #[error("job {job_id} did not complete within {}s", timeout.as_secs_f64())]
    Timeout { job_id: String, timeout: Duration },

    #[error("download of '{filename}' failed: {message}")]
    Download { filename: String, message: String },

    #[error("no {extension} segments found in {}", dir.display())]
    EmptyInput { dir: PathBuf, extension: String },

    #[error("duration probe of {} failed: {message}", path.display())]
    Probe { path: PathBuf, message: String },

    #[error("trim of {} failed: {message}", path.display())]
    TrimFailure { path: PathBuf, message: String },

    #[error("concat into {} failed: {message}", output.display())]
    ConcatFailure { output: PathBuf, message: String },

    #[error("workflow error: {0}")]
    Workflow(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Failures the assembler turns into an untrimmed fallback for one segment.
    /// Any other error from the media toolkit aborts the assembly.
    pub fn is_segment_local(&self) -> bool {
        matches!(self, Self::Probe { .. } | Self::TrimFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_file_or_job() {
        let err = PipelineError::NotFound(PathBuf::from("/tmp/missing.png"));
        assert_eq!(err.to_string(), "file not found: /tmp/missing.png");

        let err = PipelineError::Timeout {
            job_id: "abc".to_string(),
            timeout: Duration::from_secs(20),
        };
        assert_eq!(err.to_string(), "job abc did not complete within 20s");

        let err = PipelineError::EmptyInput {
            dir: PathBuf::from("out/tmp/demo"),
            extension: ".mp4".to_string(),
        };
        assert_eq!(err.to_string(), "no .mp4 segments found in out/tmp/demo");
    }

    #[test]
    fn only_probe_and_trim_are_segment_local() {
        let trim = PipelineError::TrimFailure {
            path: PathBuf::from("b.mp4"),
            message: "exit 1".to_string(),
        };
        let concat = PipelineError::ConcatFailure {
            output: PathBuf::from("final.mp4"),
            message: "exit 1".to_string(),
        };
        assert!(trim.is_segment_local());
        assert!(!concat.is_segment_local());
    }
}
