//! Platform shims: the handful of places where correct process plumbing
//! diverges per OS.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::process::Command;

use sluice_child::SharedChild;

/// Serializes pipe creation and spawning on Windows.
///
/// `CreateProcess` with inherited stdio temporarily duplicates handles as
/// inheritable; a pipe created concurrently on another thread can leak into
/// that child and keep the pipe from ever reaching EOF. One process-wide
/// mutex around both operations closes the window. This cannot defend
/// against other libraries spawning concurrently.
#[cfg(windows)]
static INHERIT_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// A unidirectional pipe with both ends non-inheritable.
pub(crate) fn pipe_pair() -> io::Result<(os_pipe::PipeReader, os_pipe::PipeWriter)> {
    #[cfg(windows)]
    let _guard = INHERIT_LOCK.lock().unwrap();
    os_pipe::pipe()
}

/// Spawn under the same guard as [`pipe_pair`].
pub(crate) fn spawn_guarded(command: &mut Command) -> io::Result<SharedChild> {
    #[cfg(windows)]
    let _guard = INHERIT_LOCK.lock().unwrap();
    SharedChild::spawn(command)
}

/// Install a process-wide `SIGPIPE` ignore, once.
///
/// Writes into a dead child's stdin must come back as `EPIPE` for the stdin
/// pump to swallow, not kill the whole process. The Rust runtime arranges
/// this for ordinary binaries, but not when the library is driven from a
/// foreign `main`.
#[cfg(unix)]
pub(crate) fn suppress_sigpipe_once() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    });
}

#[cfg(not(unix))]
pub(crate) fn suppress_sigpipe_once() {}

/// Environment variable names are case-insensitive on Windows; fold every
/// key before it touches the map so overlays and removals line up with the
/// inherited parent environment.
pub(crate) fn fold_env_name(name: &OsStr) -> OsString {
    if cfg!(windows) {
        name.to_string_lossy().to_uppercase().into()
    } else {
        name.to_os_string()
    }
}

/// Join a leading `.` onto relative typed paths.
///
/// A bare `Path::new("prog")` must mean "this file, here" rather than a PATH
/// lookup, and on POSIX exec won't touch the current directory without the
/// `./`. Almost-absolute Windows paths (`\x`, rooted but driveless) are left
/// alone.
pub(crate) fn dot_prefix(path: &Path) -> OsString {
    if path.is_absolute() || path.has_root() {
        path.as_os_str().to_os_string()
    } else {
        Path::new(".").join(path).into_os_string()
    }
}

/// Make a relative program path survive a `dir` override.
///
/// On POSIX the exec happens after the child's chdir, which would silently
/// reinterpret `./script` against the new directory; resolving against the
/// parent's cwd up front keeps `dir` free of that side effect. Plain names
/// without a separator stay PATH lookups. Windows resolves the program
/// against the parent's cwd already.
pub(crate) fn resolve_program(program: &OsStr, dir: Option<&Path>) -> io::Result<OsString> {
    if cfg!(windows) || dir.is_none() {
        return Ok(program.to_os_string());
    }
    let path = Path::new(program);
    if path.is_absolute() || path.components().count() < 2 {
        return Ok(program.to_os_string());
    }
    Ok(std::fs::canonicalize(path)?.into_os_string())
}
