//! External codec/probe collaborator: duration probe, stream-copy trim, concat.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::logging::FFMPEG_STDERR_TARGET;

/// Trailing stderr lines quoted in an ffmpeg failure message.
const STDERR_TAIL_LINES: usize = 8;

pub trait MediaToolkit {
    /// Duration of the media file in seconds.
    fn probe_duration(&self, path: &Path) -> PipelineResult<f64>;

    /// Cut `input` to its first `seconds` without re-encoding.
    fn trim(&self, input: &Path, output: &Path, seconds: f64) -> PipelineResult<()>;

    /// Stream-copy every file listed in a concat-demuxer manifest into `output`.
    fn concat(&self, manifest: &Path, output: &Path) -> PipelineResult<()>;
}

impl<T: MediaToolkit + ?Sized> MediaToolkit for &T {
    fn probe_duration(&self, path: &Path) -> PipelineResult<f64> {
        (**self).probe_duration(path)
    }

    fn trim(&self, input: &Path, output: &Path, seconds: f64) -> PipelineResult<()> {
        (**self).trim(input, output, seconds)
    }

    fn concat(&self, manifest: &Path, output: &Path) -> PipelineResult<()> {
        (**self).concat(manifest, output)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegToolkit {
    tools_dir: Option<PathBuf>,
}

impl FfmpegToolkit {
    pub fn new(tools_dir: Option<PathBuf>) -> Self {
        Self { tools_dir }
    }

    fn command(&self, binary: &str) -> Command {
        crate::runtime::command_for(binary, self.tools_dir.as_deref())
    }

    /// Run ffmpeg, streaming its stderr into the debug log.
    fn run_ffmpeg(&self, args: &[OsString]) -> Result<(), String> {
        debug!(cmd = %format!("ffmpeg {}", display_args(args)), "running ffmpeg");

        let mut child = self
            .command("ffmpeg")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("failed to launch ffmpeg (is it installed?): {err}"))?;

        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(stderr) = child.stderr.take() {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        debug!(target: FFMPEG_STDERR_TARGET, "{}", line);
                        keep_tail(&mut tail, line);
                    }
                    Err(err) => {
                        debug!(target: FFMPEG_STDERR_TARGET, "read error: {}", err);
                        break;
                    }
                }
            }
        }

        let status = child
            .wait()
            .map_err(|err| format!("failed to wait for ffmpeg: {err}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "ffmpeg exited with {status}: {}",
                Vec::from(tail).join(" | ")
            ))
        }
    }
}

fn keep_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

impl MediaToolkit for FfmpegToolkit {
    fn probe_duration(&self, path: &Path) -> PipelineResult<f64> {
        let probe_error = |message: String| PipelineError::Probe {
            path: path.to_path_buf(),
            message,
        };

        let output = self
            .command("ffprobe")
            .args(probe_duration_args(path))
            .stdin(Stdio::null())
            .output()
            .map_err(|err| probe_error(format!("failed to execute ffprobe: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(probe_error(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_probe_duration(&stdout)
            .ok_or_else(|| probe_error(format!("unexpected ffprobe output '{}'", stdout.trim())))
    }

    fn trim(&self, input: &Path, output: &Path, seconds: f64) -> PipelineResult<()> {
        self.run_ffmpeg(&trim_args(input, output, seconds))
            .map_err(|message| PipelineError::TrimFailure {
                path: input.to_path_buf(),
                message,
            })
    }

    fn concat(&self, manifest: &Path, output: &Path) -> PipelineResult<()> {
        self.run_ffmpeg(&concat_args(manifest, output))
            .map_err(|message| PipelineError::ConcatFailure {
                output: output.to_path_buf(),
                message,
            })
    }
}

pub fn probe_duration_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(path.as_os_str().to_owned());
    args
}

pub fn trim_args(input: &Path, output: &Path, seconds: f64) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-i".into(),
        input.as_os_str().to_owned(),
        "-t".into(),
        format!("{seconds}").into(),
        "-c".into(),
        "copy".into(),
        output.as_os_str().to_owned(),
    ]
}

pub fn concat_args(manifest: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        manifest.as_os_str().to_owned(),
        "-c".into(),
        "copy".into(),
        output.as_os_str().to_owned(),
    ]
}

/// ffprobe prints a single numeric token (or `N/A`) for `format=duration`.
pub fn parse_probe_duration(stdout: &str) -> Option<f64> {
    let mut tokens = stdout.split_whitespace();
    let value = tokens.next()?.parse::<f64>().ok()?;
    if tokens.next().is_some() || !value.is_finite() {
        return None;
    }
    Some(value)
}

/// One `file '<path>'` line for the concat demuxer, byte-exact for any path.
pub fn manifest_line(path: &Path) -> Vec<u8> {
    let raw = path.as_os_str().as_encoded_bytes();
    let mut line = Vec::with_capacity(raw.len() + 8);
    line.extend_from_slice(b"file '");
    for &byte in raw {
        if byte == b'\'' {
            line.extend_from_slice(br"'\''");
        } else {
            line.push(byte);
        }
    }
    line.extend_from_slice(b"'\n");
    line
}

fn display_args(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
