//! Background IO pumps: threads that shovel bytes between memory and child
//! pipes so the parent never deadlocks against its own children.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

pub(crate) type InputThread = JoinHandle<io::Result<()>>;
pub(crate) type CaptureThread = JoinHandle<io::Result<Vec<u8>>>;

/// Feed `bytes` into the pipe from a background thread.
///
/// The write end drops (and closes) with the thread, which is what delivers
/// EOF to the child. A child that exits without draining its stdin breaks
/// the pipe mid-write; that is normal and is not reported as an error.
pub(crate) fn input_writer(
    bytes: Arc<Vec<u8>>,
    mut pipe: os_pipe::PipeWriter,
) -> io::Result<InputThread> {
    Builder::new()
        .name("sluice-stdin-pump".to_string())
        .spawn(move || match pipe.write_all(&bytes) {
            Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
            _ => Ok(()),
        })
}

/// Collect everything written to the pipe until EOF.
///
/// EOF arrives once every write end is closed: the children's copies when
/// they exit, and the parent's copies when `start` finishes wiring. A
/// grandchild that inherited a write end can hold the pump open; that is why
/// nothing joins these threads except `wait`.
pub(crate) fn capture_reader(mut pipe: os_pipe::PipeReader) -> io::Result<CaptureThread> {
    Builder::new()
        .name("sluice-capture-pump".to_string())
        .spawn(move || {
            let mut bytes = Vec::new();
            pipe.read_to_end(&mut bytes)?;
            Ok(bytes)
        })
}
