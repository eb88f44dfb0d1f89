//! The live counterpart of an expression: a tree of shared children plus the
//! background threads feeding and draining them.

use std::fmt;
use std::io::{self, Read};
use std::panic;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use sluice_child::SharedChild;
use tracing::warn;

use crate::error::{Error, Result};
use crate::exec::{self, IoContext, OutputCapture};
use crate::pump::{CaptureThread, InputThread};
use crate::status::{self, ExecStatus};
use crate::{platform, Expression, Output};

/// Runtime mirror of the expression tree. Only the nodes that matter at wait
/// time survive: leaves, pipes, stdin pumps, and `unchecked` markers.
pub(crate) enum HandleNode {
    Leaf {
        child: Arc<SharedChild>,
    },
    Pipe {
        left: Box<HandleNode>,
        right: Box<HandleNode>,
    },
    StdinBytes {
        inner: Box<HandleNode>,
        thread: Mutex<Option<InputThread>>,
        error: Mutex<Option<io::Error>>,
    },
    Unchecked(Box<HandleNode>),
}

impl HandleNode {
    /// Blocking wait, reducing statuses on the way back up.
    fn wait(&self) -> io::Result<ExecStatus> {
        match self {
            HandleNode::Leaf { child } => Ok(ExecStatus::from_exit(child.wait()?)),
            HandleNode::Pipe { left, right } => {
                // Wait on both sides at once. Waiting left-to-right could
                // deadlock: the left child may be blocked writing into a
                // full pipe that only drains once the right side runs on.
                let (left_result, right_result) = thread::scope(|scope| {
                    let left_task = scope.spawn(|| left.wait());
                    let right_result = right.wait();
                    let left_result = match left_task.join() {
                        Ok(result) => result,
                        Err(payload) => panic::resume_unwind(payload),
                    };
                    (left_result, right_result)
                });
                Ok(status::reduce_pipe(left_result?, right_result?))
            }
            HandleNode::StdinBytes {
                inner,
                thread,
                error,
            } => {
                let status = inner.wait()?;
                join_input(thread, error);
                Ok(status)
            }
            HandleNode::Unchecked(inner) => Ok(inner.wait()?.into_unchecked()),
        }
    }

    /// Non-blocking wait. Polls every branch so reaping makes progress even
    /// when some other branch is still running.
    fn poll(&self) -> io::Result<Option<ExecStatus>> {
        match self {
            HandleNode::Leaf { child } => Ok(child.try_wait()?.map(ExecStatus::from_exit)),
            HandleNode::Pipe { left, right } => {
                let left_status = left.poll()?;
                let right_status = right.poll()?;
                Ok(match (left_status, right_status) {
                    (Some(left), Some(right)) => Some(status::reduce_pipe(left, right)),
                    _ => None,
                })
            }
            HandleNode::StdinBytes {
                inner,
                thread,
                error,
            } => {
                let Some(status) = inner.poll()? else {
                    return Ok(None);
                };
                // A grandchild that inherited the pipe can keep the pump
                // alive after the leaf exits; report not-finished instead of
                // blocking on the join.
                if thread
                    .lock()
                    .unwrap()
                    .as_ref()
                    .is_some_and(|t| !t.is_finished())
                {
                    return Ok(None);
                }
                join_input(thread, error);
                Ok(Some(status))
            }
            HandleNode::Unchecked(inner) => Ok(inner.poll()?.map(ExecStatus::into_unchecked)),
        }
    }

    /// Signal every leaf. No reaping, no thread joins.
    fn kill(&self) -> io::Result<()> {
        match self {
            HandleNode::Leaf { child } => child.kill(),
            HandleNode::Pipe { left, right } => {
                let left_result = left.kill();
                let right_result = right.kill();
                left_result.and(right_result)
            }
            HandleNode::StdinBytes { inner, .. } | HandleNode::Unchecked(inner) => inner.kill(),
        }
    }

    /// Reap every leaf, discarding statuses and errors. Used after a kill,
    /// when the children are already dead or dying; pump threads are left to
    /// finish on their own.
    fn reap(&self) {
        match self {
            HandleNode::Leaf { child } => {
                if let Err(err) = child.wait() {
                    warn!(pid = child.id(), %err, "failed to reap killed child");
                }
            }
            HandleNode::Pipe { left, right } => {
                left.reap();
                right.reap();
            }
            HandleNode::StdinBytes { inner, .. } | HandleNode::Unchecked(inner) => inner.reap(),
        }
    }

    fn pids_into(&self, pids: &mut Vec<u32>) {
        match self {
            HandleNode::Leaf { child } => {
                if !child.reaped() {
                    pids.push(child.id());
                }
            }
            HandleNode::Pipe { left, right } => {
                left.pids_into(pids);
                right.pids_into(pids);
            }
            HandleNode::StdinBytes { inner, .. } | HandleNode::Unchecked(inner) => {
                inner.pids_into(pids)
            }
        }
    }

    fn take_pump_errors(&self, out: &mut Vec<io::Error>) {
        match self {
            HandleNode::Leaf { .. } => {}
            HandleNode::Pipe { left, right } => {
                left.take_pump_errors(out);
                right.take_pump_errors(out);
            }
            HandleNode::StdinBytes { inner, error, .. } => {
                if let Some(err) = error.lock().unwrap().take() {
                    out.push(err);
                }
                inner.take_pump_errors(out);
            }
            HandleNode::Unchecked(inner) => inner.take_pump_errors(out),
        }
    }
}

fn join_input(thread: &Mutex<Option<InputThread>>, error: &Mutex<Option<io::Error>>) {
    let Some(thread) = thread.lock().unwrap().take() else {
        return;
    };
    let result = match thread.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("stdin pump thread panicked")),
    };
    if let Err(err) = result {
        warn!(%err, "stdin pump failed");
        *error.lock().unwrap() = Some(err);
    }
}

fn join_capture(
    slot: &Mutex<Option<CaptureThread>>,
    errors: &mut Vec<io::Error>,
) -> Option<Vec<u8>> {
    let thread = slot.lock().unwrap().take()?;
    match thread.join() {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(err)) => {
            errors.push(err);
            None
        }
        Err(_) => {
            errors.push(io::Error::other("capture pump thread panicked"));
            None
        }
    }
}

/// The finished result, computed once and shared by every subsequent
/// `wait`/`try_wait`.
struct FinishResult {
    status: ExecStatus,
    outcome: std::result::Result<Output, SavedPumpError>,
}

/// `io::Error` is not `Clone`; keep enough of a deferred pump failure to
/// rebuild it for each caller.
struct SavedPumpError {
    kind: io::ErrorKind,
    message: String,
}

impl SavedPumpError {
    fn to_error(&self) -> Error {
        Error::Pump {
            source: io::Error::new(self.kind, self.message.clone()),
        }
    }
}

/// One or more running child processes, returned by
/// [`Expression::start`](crate::Expression::start).
///
/// Dropping a `Handle` without waiting leaves the children running (and,
/// once they exit, as zombies until the parent itself exits). Long-running
/// programs should always `wait`, possibly after a `kill`.
pub struct Handle {
    root: HandleNode,
    repr: String,
    stdout_thread: Mutex<Option<CaptureThread>>,
    stderr_thread: Mutex<Option<CaptureThread>>,
    finish_lock: Mutex<()>,
    result: OnceLock<FinishResult>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("repr", &self.repr).finish()
    }
}

impl Handle {
    pub(crate) fn start(expr: &Expression) -> Result<Handle> {
        let (handle, _reader) = Handle::start_inner(expr, false)?;
        Ok(handle)
    }

    pub(crate) fn start_reader(expr: &Expression) -> Result<ReaderHandle> {
        let captured = expr.stdout_capture();
        let (handle, reader) = Handle::start_inner(&captured, true)?;
        Ok(ReaderHandle { handle, reader })
    }

    fn start_inner(
        expr: &Expression,
        reader_mode: bool,
    ) -> Result<(Handle, Option<os_pipe::PipeReader>)> {
        platform::suppress_sigpipe_once();
        let stdout_capture = OutputCapture::new();
        let stderr_capture = OutputCapture::new();
        let mut spawned = Vec::new();

        let root = {
            let context = IoContext::root(&stdout_capture, &stderr_capture);
            match exec::start_node(expr.node(), context, &mut spawned) {
                Ok(root) => root,
                Err(err) => {
                    exec::cleanup_spawned(&spawned);
                    return Err(err);
                }
            }
        };

        // In reader mode the caller owns the capture read end directly; no
        // background reader is spawned for stdout.
        let (stdout_thread, reader) = if reader_mode {
            (None, stdout_capture.take_read_end())
        } else {
            match stdout_capture.into_reader_thread() {
                Ok(thread) => (thread, None),
                Err(err) => {
                    exec::cleanup_spawned(&spawned);
                    return Err(err);
                }
            }
        };
        let stderr_thread = match stderr_capture.into_reader_thread() {
            Ok(thread) => thread,
            Err(err) => {
                exec::cleanup_spawned(&spawned);
                return Err(err);
            }
        };

        let handle = Handle {
            root,
            repr: format!("{:?}", expr),
            stdout_thread: Mutex::new(stdout_thread),
            stderr_thread: Mutex::new(stderr_thread),
            finish_lock: Mutex::new(()),
            result: OnceLock::new(),
        };
        Ok((handle, reader))
    }

    /// Block until every child has exited, join the IO pumps, and return the
    /// output.
    ///
    /// This never reports a non-zero exit status as an error; that check
    /// belongs to `run` and `read`. A deferred pump failure is reported here,
    /// but only when the reduced status is zero: a real status wins.
    pub fn wait(&self) -> Result<&Output> {
        match &self.finish_blocking()?.outcome {
            Ok(output) => Ok(output),
            Err(saved) => Err(saved.to_error()),
        }
    }

    /// Return the output if every child has exited and every pump has
    /// finished, without blocking on either.
    pub fn try_wait(&self) -> Result<Option<&Output>> {
        match self.finish_poll()? {
            None => Ok(None),
            Some(finish) => match &finish.outcome {
                Ok(output) => Ok(Some(output)),
                Err(saved) => Err(saved.to_error()),
            },
        }
    }

    /// Send a kill signal to every still-running leaf.
    ///
    /// This neither reaps the children nor joins IO pump threads (a
    /// grandchild may hold a pipe open indefinitely); call `wait` afterwards
    /// to reap. Already-exited children are skipped without error.
    pub fn kill(&self) -> Result<()> {
        self.root.kill().map_err(Error::platform("kill expression"))
    }

    /// PIDs of the still-live leaves, in pipeline order.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        self.root.pids_into(&mut pids);
        pids
    }

    /// Wait, then apply the checked-status rule: a checked non-zero status
    /// becomes [`Error::Status`] carrying the full output.
    pub(crate) fn into_output(self) -> Result<Output> {
        let (status, output) = {
            let finish = self.finish_blocking()?;
            match &finish.outcome {
                Ok(output) => (finish.status, output.clone()),
                Err(saved) => return Err(saved.to_error()),
            }
        };
        if status.is_checked_error() {
            return Err(Error::Status {
                expression: self.repr,
                output,
            });
        }
        Ok(output)
    }

    /// The checked-status rule without consuming the handle; the
    /// `ReaderHandle` EOF path uses this.
    fn check_status(&self) -> Result<()> {
        let finish = self.finish_blocking()?;
        match &finish.outcome {
            Err(saved) => Err(saved.to_error()),
            Ok(output) if finish.status.is_checked_error() => Err(Error::Status {
                expression: self.repr.clone(),
                output: output.clone(),
            }),
            Ok(_) => Ok(()),
        }
    }

    fn kill_and_reap(&self) {
        if let Err(err) = self.root.kill() {
            warn!(%err, "failed to kill expression");
        }
        self.root.reap();
    }

    fn finish_blocking(&self) -> Result<&FinishResult> {
        if let Some(finish) = self.result.get() {
            return Ok(finish);
        }
        let _guard = self.finish_lock.lock().unwrap();
        if let Some(finish) = self.result.get() {
            return Ok(finish);
        }
        let status = self
            .root
            .wait()
            .map_err(Error::platform("wait for expression"))?;
        Ok(self.store(status))
    }

    fn finish_poll(&self) -> Result<Option<&FinishResult>> {
        if let Some(finish) = self.result.get() {
            return Ok(Some(finish));
        }
        // A blocking wait in flight will publish the result; don't queue up
        // behind it.
        let Ok(_guard) = self.finish_lock.try_lock() else {
            return Ok(None);
        };
        if let Some(finish) = self.result.get() {
            return Ok(Some(finish));
        }
        let Some(status) = self
            .root
            .poll()
            .map_err(Error::platform("poll expression"))?
        else {
            return Ok(None);
        };
        if !self.captures_finished() {
            return Ok(None);
        }
        Ok(Some(self.store(status)))
    }

    fn captures_finished(&self) -> bool {
        let stdout_done = self
            .stdout_thread
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |t| t.is_finished());
        let stderr_done = self
            .stderr_thread
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |t| t.is_finished());
        stdout_done && stderr_done
    }

    /// Join the pumps, fold their errors per the deferred-error rule, and
    /// publish the result. Caller holds `finish_lock`.
    fn store(&self, status: ExecStatus) -> &FinishResult {
        let mut pump_errors = Vec::new();
        self.root.take_pump_errors(&mut pump_errors);
        let stdout = join_capture(&self.stdout_thread, &mut pump_errors);
        let stderr = join_capture(&self.stderr_thread, &mut pump_errors);
        for err in &pump_errors {
            warn!(%err, "background i/o pump failed");
        }
        let output = Output {
            status: status.code,
            stdout,
            stderr,
        };
        let outcome = if status.code == 0 {
            match pump_errors.into_iter().next() {
                Some(err) => Err(SavedPumpError {
                    kind: err.kind(),
                    message: err.to_string(),
                }),
                None => Ok(output),
            }
        } else {
            Ok(output)
        };
        self.result.get_or_init(|| FinishResult { status, outcome })
    }
}

/// A byte stream over an expression's standard output, returned by
/// [`Expression::reader`](crate::Expression::reader).
///
/// Reading to EOF awaits the children, so a checked failure surfaces as an
/// `io::Error` from the final `read`. Dropping the reader before EOF kills
/// and reaps the expression instead.
pub struct ReaderHandle {
    handle: Handle,
    reader: Option<os_pipe::PipeReader>,
}

impl ReaderHandle {
    /// Kill the underlying expression. Readers blocked in `read` on another
    /// thread will see EOF or a broken pipe shortly after.
    pub fn kill(&self) -> Result<()> {
        self.handle.kill()
    }

    /// Non-blocking status check. The `stdout` field of the returned output
    /// is always `None`: this reader owns the stdout pipe.
    pub fn try_wait(&self) -> Result<Option<&Output>> {
        self.handle.try_wait()
    }

    /// PIDs of the still-live leaves, in pipeline order.
    pub fn pids(&self) -> Vec<u32> {
        self.handle.pids()
    }
}

impl Read for ReaderHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            // Past EOF; the children have already been awaited.
            return Ok(0);
        };
        let n = reader.read(buf)?;
        if n == 0 && !buf.is_empty() {
            // EOF: close our end, then await the expression. Checked
            // failures and deferred pump errors surface from this read.
            self.reader = None;
            self.handle.check_status().map_err(io::Error::from)?;
        }
        Ok(n)
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        if self.reader.is_some() {
            // Abandoned before EOF: tear the children down so nothing leaks.
            // Statuses and pump errors are deliberately discarded.
            self.reader = None;
            self.handle.kill_and_reap();
        }
    }
}
