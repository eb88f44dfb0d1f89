//! Race-free shared access to a child process.
//!
//! `std::process::Child` wants `&mut self` for both `wait` and `kill`, so one
//! thread cannot block in `wait` while another decides to kill. Worse, a
//! naive kill-concurrent-with-wait has a real race on Unix: if the waiting
//! thread reaps the child just before the killing thread sends its signal,
//! the OS is free to recycle the PID, and the signal lands on an unrelated
//! process.
//!
//! [`SharedChild`] closes that race. Blocking waits go through
//! `waitid(..., WNOWAIT)`, which observes the exit *without* freeing the PID,
//! and the final reap is serialized with `kill` under a state lock. `kill`
//! refuses to signal once any thread has observed the exit, so the signal can
//! never reach a recycled PID.

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::sync::{Condvar, Mutex};

use tracing::debug;

#[cfg(unix)]
#[path = "sys_unix.rs"]
mod sys;
#[cfg(windows)]
#[path = "sys_windows.rs"]
mod sys;

/// Lifecycle of the wrapped child.
///
/// `NotWaited`: nobody has observed the exit; the PID is valid and `kill` may
/// signal it. `Exiting`: the child has exited and one thread is reaping it;
/// the PID may be freed at any moment. `Reaped`: the status is published.
enum ChildState {
    NotWaited,
    Exiting,
    Reaped(ExitStatus),
}

/// A child process that can be waited on and killed from any thread.
pub struct SharedChild {
    /// Owns the OS child. Locked only for non-blocking operations; blocking
    /// waits use the PID/handle directly so they never starve other callers.
    child: Mutex<Child>,
    id: u32,
    #[cfg(windows)]
    handle: sys::RawChildHandle,
    state: Mutex<ChildState>,
    reaped: Condvar,
}

impl SharedChild {
    /// Spawn the command and wrap the resulting child.
    pub fn spawn(command: &mut Command) -> io::Result<SharedChild> {
        let child = command.spawn()?;
        let id = child.id();
        debug!(pid = id, "spawned child");
        Ok(SharedChild {
            #[cfg(windows)]
            handle: sys::RawChildHandle::of(&child),
            child: Mutex::new(child),
            id,
            state: Mutex::new(ChildState::NotWaited),
            reaped: Condvar::new(),
        })
    }

    /// The OS process ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True once some call has collected the child's exit status.
    pub fn reaped(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ChildState::Reaped(_))
    }

    /// Block until the child exits, reap it, and return its status.
    ///
    /// Any number of threads may call this concurrently; every caller
    /// observes the same status, and the PID is freed exactly once.
    pub fn wait(&self) -> io::Result<ExitStatus> {
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                ChildState::Reaped(status) => return Ok(status),
                // Another thread is mid-reap and will publish shortly.
                ChildState::Exiting => state = self.reaped.wait(state).unwrap(),
                ChildState::NotWaited => {
                    // Block with the lock released so kill/try_wait stay
                    // responsive, and without reaping so the PID stays ours.
                    drop(state);
                    self.block_without_reaping()?;
                    state = self.state.lock().unwrap();
                    if let ChildState::NotWaited = *state {
                        *state = ChildState::Exiting;
                        drop(state);
                        // The child has exited, so this wait cannot block.
                        let result = self.child.lock().unwrap().wait();
                        state = self.state.lock().unwrap();
                        match result {
                            Ok(status) => {
                                debug!(pid = self.id, code = ?status.code(), "reaped child");
                                *state = ChildState::Reaped(status);
                                self.reaped.notify_all();
                                return Ok(status);
                            }
                            Err(err) => {
                                // Let other waiters retry rather than hang.
                                *state = ChildState::NotWaited;
                                self.reaped.notify_all();
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Reap and return the status if the child has already exited.
    ///
    /// Never blocks and never transitions a still-running child out of its
    /// unwaited state.
    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        let state = self.state.lock().unwrap();
        match *state {
            ChildState::Reaped(status) => Ok(Some(status)),
            // A blocking waiter is about to publish; from the caller's point
            // of view the status is not available yet.
            ChildState::Exiting => Ok(None),
            ChildState::NotWaited => {
                if self.poll_without_reaping()? {
                    drop(state);
                    // Exited already, so this cannot block.
                    self.wait().map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Send `SIGKILL` (`TerminateProcess` on Windows) unless the child's exit
    /// has already been observed, in which case this is a success no-op.
    ///
    /// Holding the state lock across the signal is what makes this safe: a
    /// child observed as `NotWaited` cannot have had its PID freed, because
    /// reaping happens under the same lock after the `WNOWAIT` inspection.
    pub fn kill(&self) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        if let ChildState::NotWaited = *state {
            // Exited-but-unreaped children need no signal, and signaling
            // them is an error on some platforms.
            if self.poll_without_reaping()? {
                return Ok(());
            }
            debug!(pid = self.id, "killing child");
            #[cfg(unix)]
            sys::kill(self.id)?;
            #[cfg(windows)]
            self.child.lock().unwrap().kill()?;
        }
        drop(state);
        Ok(())
    }

    fn block_without_reaping(&self) -> io::Result<()> {
        #[cfg(unix)]
        return sys::wait_without_reaping(self.id);
        #[cfg(windows)]
        return sys::wait_without_reaping(&self.handle);
    }

    fn poll_without_reaping(&self) -> io::Result<bool> {
        #[cfg(unix)]
        return sys::poll_without_reaping(self.id);
        #[cfg(windows)]
        return sys::poll_without_reaping(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn spawn_sh(script: &str) -> Result<SharedChild> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        Ok(SharedChild::spawn(&mut command)?)
    }

    #[test]
    fn wait_returns_exit_code() -> Result<()> {
        let child = spawn_sh("exit 7")?;
        let status = child.wait()?;
        assert_eq!(status.code(), Some(7));
        // Repeated waits observe the cached status.
        assert_eq!(child.wait()?.code(), Some(7));
        assert!(child.reaped());
        Ok(())
    }

    #[test]
    fn kill_then_wait_reports_signal() -> Result<()> {
        let child = spawn_sh("sleep 60")?;
        child.kill()?;
        let status = child.wait()?;
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(libc::SIGKILL));
        }
        assert!(!status.success());
        Ok(())
    }

    #[test]
    fn try_wait_does_not_block() -> Result<()> {
        let child = spawn_sh("sleep 60")?;
        assert!(child.try_wait()?.is_none());
        assert!(!child.reaped());
        child.kill()?;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            thread::sleep(Duration::from_millis(10));
        };
        assert!(!status.success());
        Ok(())
    }

    #[test]
    fn concurrent_waiters_observe_one_status() -> Result<()> {
        let child = Arc::new(spawn_sh("sleep 60")?);
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let child = Arc::clone(&child);
            waiters.push(thread::spawn(move || child.wait()));
        }
        // Give the waiters time to block in waitid before the kill.
        thread::sleep(Duration::from_millis(50));
        child.kill()?;
        let mut statuses = Vec::new();
        for waiter in waiters {
            statuses.push(waiter.join().expect("waiter panicked")?);
        }
        assert!(statuses.windows(2).all(|pair| pair[0] == pair[1]));
        Ok(())
    }

    #[test]
    fn kill_after_reap_is_a_noop() -> Result<()> {
        let child = spawn_sh("exit 0")?;
        let status = child.wait()?;
        assert!(status.success());
        // The PID may already belong to someone else; kill must not signal.
        child.kill()?;
        child.kill()?;
        Ok(())
    }
}
