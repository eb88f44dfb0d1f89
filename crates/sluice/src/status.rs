//! Status reduction: folding leaf exit statuses through the composition
//! operators with pipefail and `unchecked` semantics.

use std::process::ExitStatus;

/// A reduced exit status. `checked` is cleared by an enclosing `unchecked`,
/// which suppresses the non-zero-exit error without changing the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExecStatus {
    pub(crate) code: i32,
    pub(crate) checked: bool,
}

impl ExecStatus {
    pub(crate) fn from_exit(status: ExitStatus) -> ExecStatus {
        ExecStatus {
            code: decode_exit(status),
            checked: true,
        }
    }

    /// A status that `run`/`read` must report as an error.
    pub(crate) fn is_checked_error(self) -> bool {
        self.code != 0 && self.checked
    }

    pub(crate) fn into_unchecked(mut self) -> ExecStatus {
        self.checked = false;
        self
    }
}

/// Pipefail with sticky `unchecked`: the rightmost checked failure wins, then
/// the leftmost; otherwise the pipeline reports the right side's code, and it
/// is checked only if both sides were.
pub(crate) fn reduce_pipe(left: ExecStatus, right: ExecStatus) -> ExecStatus {
    if right.is_checked_error() {
        right
    } else if left.is_checked_error() {
        left
    } else {
        ExecStatus {
            code: right.code,
            checked: right.checked && left.checked,
        }
    }
}

/// Decode an OS exit status to one integer: the exit code, or `128 + N` for
/// a child terminated by signal N.
#[cfg(unix)]
pub(crate) fn decode_exit(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
pub(crate) fn decode_exit(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(code: i32) -> ExecStatus {
        ExecStatus { code, checked: true }
    }

    fn unchecked(code: i32) -> ExecStatus {
        ExecStatus { code, checked: false }
    }

    #[test]
    fn rightmost_checked_failure_wins() {
        assert_eq!(reduce_pipe(checked(1), checked(3)), checked(3));
        assert_eq!(reduce_pipe(checked(0), checked(3)), checked(3));
        assert_eq!(reduce_pipe(checked(1), checked(0)), checked(1));
    }

    #[test]
    fn unchecked_failures_do_not_mask_siblings() {
        // Left unchecked, right clean: the pipe is clean but no longer fully
        // checked.
        assert_eq!(reduce_pipe(unchecked(1), checked(0)), unchecked(0));
        // Right unchecked failure loses to a checked left failure.
        assert_eq!(reduce_pipe(checked(1), unchecked(3)), checked(1));
        // Both unchecked: the right code flows through.
        assert_eq!(reduce_pipe(unchecked(1), unchecked(3)), unchecked(3));
    }

    #[test]
    fn clean_pipelines_stay_checked() {
        assert_eq!(reduce_pipe(checked(0), checked(0)), checked(0));
    }
}
