//! Unix wait/kill primitives.
//!
//! `waitid` with `WNOWAIT` observes an exit without freeing the PID, which is
//! the property the shared kill/wait protocol depends on. We call libc
//! directly because nix does not expose `waitid` on every Unix we build for.

use std::io;

use nix::sys::signal::{kill as send_signal, Signal};
use nix::unistd::Pid;

fn waitid_nowait(pid: u32, flags: libc::c_int) -> io::Result<libc::siginfo_t> {
    // Zeroed so a WNOHANG "still running" result is distinguishable: the
    // kernel leaves the struct untouched in that case.
    let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::waitid(libc::P_PID, pid as libc::id_t, &mut siginfo, flags) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(siginfo)
}

/// Block until the child exits, without reaping it.
pub(crate) fn wait_without_reaping(pid: u32) -> io::Result<()> {
    loop {
        match waitid_nowait(pid, libc::WEXITED | libc::WNOWAIT) {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// True if the child has exited. Never reaps.
pub(crate) fn poll_without_reaping(pid: u32) -> io::Result<bool> {
    let siginfo = loop {
        match waitid_nowait(pid, libc::WEXITED | libc::WNOWAIT | libc::WNOHANG) {
            Ok(info) => break info,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    };
    Ok(siginfo.si_signo != 0)
}

/// Send SIGKILL. The caller guarantees the PID has not been reaped.
pub(crate) fn kill(pid: u32) -> io::Result<()> {
    send_signal(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(io::Error::from)
}
