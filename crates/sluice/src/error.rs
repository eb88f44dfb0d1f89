//! The library's error type.

use std::io;

use crate::Output;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS refused to start a leaf command. Any pipeline siblings that had
    /// already started were killed and reaped before this was returned.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A syscall failed while setting up redirections, pipes, or waits.
    #[error("{op}: {source}")]
    Platform {
        op: String,
        #[source]
        source: io::Error,
    },

    /// A background IO thread failed while copying bytes. Broken-pipe writes
    /// to a child's stdin are swallowed and never produce this. Only reported
    /// when the expression itself exited cleanly; a real status wins.
    #[error("background i/o failed: {source}")]
    Pump {
        #[source]
        source: io::Error,
    },

    /// A checked expression finished with a non-zero status. Returned by
    /// `run` and `read`; `wait` reports statuses without erroring.
    #[error("expression {} exited with status {}", .expression, .output.status)]
    Status { expression: String, output: Output },

    /// `read` captured bytes that were not valid UTF-8.
    #[error("captured stdout is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl Error {
    /// The output of a failed expression, when this is a status error.
    pub fn output(&self) -> Option<&Output> {
        match self {
            Error::Status { output, .. } => Some(output),
            _ => None,
        }
    }

    pub(crate) fn platform(op: impl Into<String>) -> impl FnOnce(io::Error) -> Error {
        let op = op.into();
        move |source| Error::Platform { op, source }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match &err {
            Error::Spawn { source, .. }
            | Error::Platform { source, .. }
            | Error::Pump { source } => source.kind(),
            Error::Status { .. } => io::ErrorKind::Other,
            Error::Utf8(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}
