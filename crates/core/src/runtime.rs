use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::debug;

/// Directories probed for bundled `ffmpeg`/`ffprobe` before falling back to `PATH`.
///
/// Order: the configured tools directory, `<exe_dir>/`, `<exe_dir>/bin/`,
/// `<exe_dir>/../bin/`, `<cwd>/bin/`.
fn candidate_bin_dirs(tools_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = tools_dir {
        dirs.push(dir.to_path_buf());
    }

    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    if binary.to_ascii_lowercase().ends_with(".exe") {
        return vec![binary.to_string()];
    }
    vec![format!("{binary}.exe"), binary.to_string()]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Build a command for an external tool, preferring a bundled copy.
pub fn command_for(binary: &str, tools_dir: Option<&Path>) -> ProcessCommand {
    match find_binary_in_dirs(binary, &candidate_bin_dirs(tools_dir)) {
        Some(path) => {
            debug!(binary, path = %path.display(), "using bundled tool");
            ProcessCommand::new(path)
        }
        None => ProcessCommand::new(binary),
    }
}
