//! External executables: lookup on a search path and invocation with
//! explicit output paths.

use log::{debug, info};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Search path taken from `$PATH`
pub fn default_search_path() -> OsString {
    std::env::var_os("PATH").unwrap_or_default()
}

/// Locate `exe` in the directories of `search_path`
pub fn find_executable(exe: &str, search_path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .map(|dir| dir.join(exe))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolve `exe` or fail with the error a misconfigured environment deserves
pub fn require_executable(exe: &str, search_path: &OsStr) -> io::Result<PathBuf> {
    find_executable(exe, search_path).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("\"{}\" is not in your $PATH", exe),
        )
    })
}

/// Run `command` with stdout and stderr sent to `log_file`.
/// The exit status is returned, not judged.
pub fn run_logged(mut command: Command, log_file: &Path) -> io::Result<ExitStatus> {
    let log = File::create(log_file)?;
    let log_err = log.try_clone()?;
    info!("Executing: {:?}", command);
    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .status()?;
    debug!("{:?} exited with {}", command.get_program(), status);
    Ok(status)
}

/// True when `path` exists and has content
pub fn non_empty_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}
