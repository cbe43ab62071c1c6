//! The now-playing helper script and its interpreter.
//!
//! MediaRemote is a private framework that only answers properly inside a
//! process with a Swift/ObjC runtime, so now-playing state is read by a small
//! Swift script run as a child process. It reports on stdout one JSON object
//! per line.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Interpreter used to run the helper.
pub const SWIFT: &str = "/usr/bin/swift";

/// File name the helper is written under.
pub const SCRIPT_NAME: &str = "media-helper.swift";

/// Source of the helper script.
pub const SCRIPT: &str = include_str!("../helpers/media-helper.swift");

/// Write the helper into `dir` and return its path.
///
/// The file is only rewritten when its content differs.
///
/// # Errors
///
/// Returns an error if `dir` cannot be created or the file cannot be written.
pub fn install_script(dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(SCRIPT_NAME);
    if fs::read_to_string(&path).ok().as_deref() != Some(SCRIPT) {
        fs::write(&path, SCRIPT)?;
        debug!(path = %path.display(), "Installed media helper");
    }
    Ok(path)
}
