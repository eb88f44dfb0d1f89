//! The start protocol: turning an expression tree into a running process
//! graph, and tearing it down again when any part of it fails to start.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use sluice_child::SharedChild;
use tracing::{debug, warn};

use crate::error::Error;
use crate::expr::{ExprNode, IoRedirect, SpawnHook};
use crate::handle::HandleNode;
use crate::{platform, pump};

/// One stdio endpoint as tracked during the recursion. Endpoints are only
/// materialized into `Stdio` at the moment a leaf spawns; until then they can
/// be duplicated cheaply for the two sides of a pipe.
pub(crate) enum IoValue {
    ParentStdin,
    ParentStdout,
    ParentStderr,
    Null,
    File(File),
    PipeReader(os_pipe::PipeReader),
    PipeWriter(os_pipe::PipeWriter),
}

impl IoValue {
    fn try_clone(&self) -> io::Result<IoValue> {
        Ok(match self {
            IoValue::ParentStdin => IoValue::ParentStdin,
            IoValue::ParentStdout => IoValue::ParentStdout,
            IoValue::ParentStderr => IoValue::ParentStderr,
            IoValue::Null => IoValue::Null,
            IoValue::File(file) => IoValue::File(file.try_clone()?),
            IoValue::PipeReader(pipe) => IoValue::PipeReader(pipe.try_clone()?),
            IoValue::PipeWriter(pipe) => IoValue::PipeWriter(pipe.try_clone()?),
        })
    }

    /// Consume the endpoint into something the OS can hand to a child. The
    /// parent inherit cases are duplicated rather than passed as
    /// `Stdio::inherit`, because redirections like `stdout_to_stderr` need a
    /// real handle for the *other* parent stream.
    fn into_stdio(self) -> io::Result<Stdio> {
        Ok(match self {
            IoValue::ParentStdin => os_pipe::dup_stdin()?.into(),
            IoValue::ParentStdout => os_pipe::dup_stdout()?.into(),
            IoValue::ParentStderr => os_pipe::dup_stderr()?.into(),
            IoValue::Null => Stdio::null(),
            IoValue::File(file) => file.into(),
            IoValue::PipeReader(pipe) => pipe.into(),
            IoValue::PipeWriter(pipe) => pipe.into(),
        })
    }
}

/// The capture pipe shared by every `stdout_capture` (or `stderr_capture`)
/// redirection in one start. Created lazily so uncaptured runs pay nothing.
pub(crate) struct OutputCapture {
    pair: Mutex<Option<(os_pipe::PipeReader, os_pipe::PipeWriter)>>,
}

impl OutputCapture {
    pub(crate) fn new() -> OutputCapture {
        OutputCapture {
            pair: Mutex::new(None),
        }
    }

    fn write_end(&self) -> io::Result<os_pipe::PipeWriter> {
        let mut pair = self.pair.lock().unwrap();
        if pair.is_none() {
            *pair = Some(platform::pipe_pair()?);
        }
        let (_, writer) = pair.as_ref().expect("capture pipe just created");
        writer.try_clone()
    }

    /// Drop the parent's write end and hand back the read end, if any
    /// capture redirection asked for the pipe.
    pub(crate) fn take_read_end(self) -> Option<os_pipe::PipeReader> {
        self.pair
            .into_inner()
            .unwrap()
            .map(|(reader, _writer)| reader)
    }

    /// Finish wiring: close the parent's write end and start the background
    /// reader, if anything was captured.
    pub(crate) fn into_reader_thread(self) -> Result<Option<pump::CaptureThread>, Error> {
        match self.take_read_end() {
            Some(reader) => pump::capture_reader(reader)
                .map(Some)
                .map_err(Error::platform("spawn capture pump thread")),
            None => Ok(None),
        }
    }
}

/// The effective child environment at one point in the recursion, built by
/// folding redirection nodes on the way down. Innermost nodes are applied
/// last, so they win.
pub(crate) struct IoContext<'a> {
    stdin: IoValue,
    stdout: IoValue,
    stderr: IoValue,
    dir: Option<PathBuf>,
    env: HashMap<OsString, OsString>,
    hooks: Vec<Arc<SpawnHook>>,
    stdout_capture: &'a OutputCapture,
    stderr_capture: &'a OutputCapture,
}

impl<'a> IoContext<'a> {
    pub(crate) fn root(
        stdout_capture: &'a OutputCapture,
        stderr_capture: &'a OutputCapture,
    ) -> IoContext<'a> {
        IoContext {
            stdin: IoValue::ParentStdin,
            stdout: IoValue::ParentStdout,
            stderr: IoValue::ParentStderr,
            dir: None,
            env: std::env::vars_os()
                .map(|(name, value)| (platform::fold_env_name(&name), value))
                .collect(),
            hooks: Vec::new(),
            stdout_capture,
            stderr_capture,
        }
    }

    fn try_clone(&self) -> io::Result<IoContext<'a>> {
        Ok(IoContext {
            stdin: self.stdin.try_clone()?,
            stdout: self.stdout.try_clone()?,
            stderr: self.stderr.try_clone()?,
            dir: self.dir.clone(),
            env: self.env.clone(),
            hooks: self.hooks.clone(),
            stdout_capture: self.stdout_capture,
            stderr_capture: self.stderr_capture,
        })
    }
}

/// Recursively start one node. Every leaf that spawns is appended to
/// `spawned`; on failure the caller kills and reaps that ledger in reverse.
pub(crate) fn start_node(
    node: &ExprNode,
    context: IoContext<'_>,
    spawned: &mut Vec<Arc<SharedChild>>,
) -> Result<HandleNode, Error> {
    match node {
        ExprNode::Exec(argv) => start_leaf(argv, context, spawned),
        ExprNode::Pipe(left, right) => start_pipe(left.node(), right.node(), context, spawned),
        ExprNode::Io(redirect, inner) => start_io(redirect, inner.node(), context, spawned),
    }
}

fn start_leaf(
    argv: &[OsString],
    context: IoContext<'_>,
    spawned: &mut Vec<Arc<SharedChild>>,
) -> Result<HandleNode, Error> {
    let program = platform::resolve_program(&argv[0], context.dir.as_deref())
        .map_err(Error::platform(format!("resolve program {:?}", argv[0])))?;
    let program_display = program.to_string_lossy().into_owned();

    let IoContext {
        stdin,
        stdout,
        stderr,
        dir,
        env,
        hooks,
        ..
    } = context;

    let mut command = Command::new(&program);
    command.args(&argv[1..]);
    if let Some(dir) = &dir {
        command.current_dir(dir);
    }
    command.env_clear();
    command.envs(env.iter());
    command.stdin(
        stdin
            .into_stdio()
            .map_err(Error::platform("prepare stdin"))?,
    );
    command.stdout(
        stdout
            .into_stdio()
            .map_err(Error::platform("prepare stdout"))?,
    );
    command.stderr(
        stderr
            .into_stdio()
            .map_err(Error::platform("prepare stderr"))?,
    );

    // Outermost hooks first, so the innermost hook has the last word.
    for hook in &hooks {
        hook(&mut command).map_err(|source| Error::Spawn {
            program: program_display.clone(),
            source,
        })?;
    }

    let child = platform::spawn_guarded(&mut command).map_err(|source| Error::Spawn {
        program: program_display,
        source,
    })?;
    debug!(pid = child.id(), program = ?program, "started leaf");
    let child = Arc::new(child);
    spawned.push(Arc::clone(&child));
    Ok(HandleNode::Leaf { child })
}

fn start_pipe(
    left: &ExprNode,
    right: &ExprNode,
    context: IoContext<'_>,
    spawned: &mut Vec<Arc<SharedChild>>,
) -> Result<HandleNode, Error> {
    let (read_end, write_end) = platform::pipe_pair().map_err(Error::platform("create pipe"))?;

    let mut left_context = context
        .try_clone()
        .map_err(Error::platform("duplicate pipe context"))?;
    left_context.stdout = IoValue::PipeWriter(write_end);
    let mut right_context = context;
    right_context.stdin = IoValue::PipeReader(read_end);

    // Left first; its copy of the write end is consumed as it spawns. If the
    // right side then fails, the caller's ledger cleanup kills and reaps the
    // left side before the error escapes `start`.
    let left_handle = start_node(left, left_context, spawned)?;
    let right_handle = start_node(right, right_context, spawned)?;
    Ok(HandleNode::Pipe {
        left: Box::new(left_handle),
        right: Box::new(right_handle),
    })
}

fn start_io(
    redirect: &IoRedirect,
    inner: &ExprNode,
    mut context: IoContext<'_>,
    spawned: &mut Vec<Arc<SharedChild>>,
) -> Result<HandleNode, Error> {
    let mut input_thread = None;
    match redirect {
        IoRedirect::StdinBytes(bytes) => {
            let (read_end, write_end) =
                platform::pipe_pair().map_err(Error::platform("create stdin pipe"))?;
            // The pump starts before the child; if the child never spawns,
            // dropping the read end breaks the pipe and the pump exits.
            let thread = pump::input_writer(Arc::clone(bytes), write_end)
                .map_err(Error::platform("spawn stdin pump thread"))?;
            input_thread = Some(thread);
            context.stdin = IoValue::PipeReader(read_end);
        }
        IoRedirect::StdinPath(path) => {
            let file = File::open(path)
                .map_err(Error::platform(format!("open {}", path.display())))?;
            context.stdin = IoValue::File(file);
        }
        IoRedirect::StdinFile(file) => {
            let file = file
                .try_clone()
                .map_err(Error::platform("duplicate stdin file"))?;
            context.stdin = IoValue::File(file);
        }
        IoRedirect::StdinNull => context.stdin = IoValue::Null,
        IoRedirect::StdoutPath(path) => {
            let file = File::create(path)
                .map_err(Error::platform(format!("create {}", path.display())))?;
            context.stdout = IoValue::File(file);
        }
        IoRedirect::StdoutFile(file) => {
            let file = file
                .try_clone()
                .map_err(Error::platform("duplicate stdout file"))?;
            context.stdout = IoValue::File(file);
        }
        IoRedirect::StdoutNull => context.stdout = IoValue::Null,
        IoRedirect::StdoutCapture => {
            let writer = context
                .stdout_capture
                .write_end()
                .map_err(Error::platform("open stdout capture pipe"))?;
            context.stdout = IoValue::PipeWriter(writer);
        }
        IoRedirect::StdoutToStderr => {
            context.stdout = context
                .stderr
                .try_clone()
                .map_err(Error::platform("duplicate stderr"))?;
        }
        IoRedirect::StderrPath(path) => {
            let file = File::create(path)
                .map_err(Error::platform(format!("create {}", path.display())))?;
            context.stderr = IoValue::File(file);
        }
        IoRedirect::StderrFile(file) => {
            let file = file
                .try_clone()
                .map_err(Error::platform("duplicate stderr file"))?;
            context.stderr = IoValue::File(file);
        }
        IoRedirect::StderrNull => context.stderr = IoValue::Null,
        IoRedirect::StderrCapture => {
            let writer = context
                .stderr_capture
                .write_end()
                .map_err(Error::platform("open stderr capture pipe"))?;
            context.stderr = IoValue::PipeWriter(writer);
        }
        IoRedirect::StderrToStdout => {
            context.stderr = context
                .stdout
                .try_clone()
                .map_err(Error::platform("duplicate stdout"))?;
        }
        IoRedirect::StdoutStderrSwap => {
            std::mem::swap(&mut context.stdout, &mut context.stderr);
        }
        IoRedirect::Dir(path) => context.dir = Some(path.clone()),
        IoRedirect::Env(name, value) => {
            context
                .env
                .insert(platform::fold_env_name(name), value.clone());
        }
        IoRedirect::EnvRemove(name) => {
            context.env.remove(&platform::fold_env_name(name));
        }
        IoRedirect::FullEnv(vars) => {
            context.env = vars
                .iter()
                .map(|(name, value)| (platform::fold_env_name(name), value.clone()))
                .collect();
        }
        IoRedirect::Unchecked => {
            let inner_handle = start_node(inner, context, spawned)?;
            return Ok(HandleNode::Unchecked(Box::new(inner_handle)));
        }
        IoRedirect::BeforeSpawn(hook) => context.hooks.push(Arc::clone(hook)),
    }

    let inner_handle = start_node(inner, context, spawned)?;
    Ok(match input_thread {
        Some(thread) => HandleNode::StdinBytes {
            inner: Box::new(inner_handle),
            thread: Mutex::new(Some(thread)),
            error: Mutex::new(None),
        },
        None => inner_handle,
    })
}

/// Partial-start cleanup: no already-spawned leaf may outlive a failed
/// `start`, as a zombie or otherwise. Most recently spawned first. Statuses
/// are deliberately discarded; the caller's error is the one that matters.
pub(crate) fn cleanup_spawned(spawned: &[Arc<SharedChild>]) {
    for child in spawned.iter().rev() {
        if let Err(err) = child.kill() {
            warn!(pid = child.id(), %err, "failed to kill partially started child");
        }
        if let Err(err) = child.wait() {
            warn!(pid = child.id(), %err, "failed to reap partially started child");
        }
    }
}
