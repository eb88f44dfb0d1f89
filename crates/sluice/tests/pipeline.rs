#![cfg(unix)]
//! Pipelines: wiring, pipefail, `unchecked` stickiness, and spawn-failure
//! cleanup.

mod support;

use anyhow::Result;
use sluice::{cmd, Error};
use support::{exit_with, sh};

#[test]
fn read_captures_and_trims() -> Result<()> {
    assert_eq!(cmd("echo", ["hi"]).read()?, "hi");
    Ok(())
}

#[test]
fn pipe_connects_stdout_to_stdin() -> Result<()> {
    let out = cmd("echo", ["hi"]).pipe(&cmd("sed", ["s/i/o/"])).read()?;
    assert_eq!(out, "ho");
    Ok(())
}

#[test]
fn pipelines_nest() -> Result<()> {
    let inner = cmd("sed", ["s/i/o/"]).pipe(&cmd("tr", ["a-z", "A-Z"]));
    let out = cmd("echo", ["hi"]).pipe(&inner).read()?;
    assert_eq!(out, "HO");
    Ok(())
}

#[test]
fn large_transfers_complete_without_deadlock() -> Result<()> {
    // A megabyte through two pipe hops, far beyond the usual 64 KiB pipe
    // buffer. Back-pressure would deadlock a left-to-right wait.
    let bytes = vec![b'a'; 1024 * 1024];
    let output = cmd("cat", None::<&str>)
        .stdin_bytes(bytes.clone())
        .pipe(&cmd("cat", None::<&str>))
        .stdout_capture()
        .run()?;
    assert_eq!(output.stdout.as_deref().map(<[u8]>::len), Some(bytes.len()));
    Ok(())
}

#[test]
fn nonzero_status_is_an_error() {
    let err = cmd("false", None::<&str>).run().unwrap_err();
    match err {
        Error::Status { output, .. } => assert_eq!(output.status, 1),
        other => panic!("expected a status error, got {other:?}"),
    }
}

#[test]
fn unchecked_suppresses_the_error_but_keeps_the_code() -> Result<()> {
    let output = cmd("false", None::<&str>).unchecked().run()?;
    assert_eq!(output.status, 1);
    assert!(!output.success());
    Ok(())
}

#[test]
fn pipefail_reports_a_left_side_failure() {
    let err = exit_with(3)
        .pipe(&cmd("cat", None::<&str>))
        .run()
        .unwrap_err();
    assert_eq!(err.output().map(|o| o.status), Some(3));
}

#[test]
fn rightmost_failure_wins() {
    let err = exit_with(1).pipe(&exit_with(4)).run().unwrap_err();
    assert_eq!(err.output().map(|o| o.status), Some(4));
}

#[test]
fn unchecked_left_failure_leaves_the_pipe_clean() -> Result<()> {
    let output = cmd("false", None::<&str>)
        .unchecked()
        .pipe(&cmd("true", None::<&str>))
        .run()?;
    assert_eq!(output.status, 0);
    Ok(())
}

#[test]
fn unchecked_does_not_mask_a_checked_sibling() {
    let err = cmd("false", None::<&str>)
        .pipe(&cmd("true", None::<&str>).unchecked())
        .run()
        .unwrap_err();
    assert_eq!(err.output().map(|o| o.status), Some(1));
}

#[test]
fn unchecked_atop_a_pipeline_keeps_the_code() -> Result<()> {
    let output = cmd("false", None::<&str>)
        .pipe(&cmd("true", None::<&str>))
        .unchecked()
        .run()?;
    assert_eq!(output.status, 1);
    Ok(())
}

#[test]
fn sigpipe_from_a_closed_downstream_is_pipefail() {
    // The left side writes forever; head closes the pipe after ten bytes,
    // and the left side dies of SIGPIPE (decoded as 128 + 13).
    let spammer = sh("while :; do echo xxxxxxxx; done");
    let err = spammer
        .pipe(&cmd("head", ["-c", "10"]))
        .read()
        .unwrap_err();
    assert_eq!(err.output().map(|o| o.status), Some(128 + libc::SIGPIPE));
}

#[test]
fn misspelled_program_is_an_immediate_spawn_error() {
    let err = cmd("echo", ["hi"])
        .pipe(&cmd("sluice-no-such-program-xyz", None::<&str>))
        .run()
        .unwrap_err();
    match err {
        Error::Spawn { program, source } => {
            assert!(program.contains("sluice-no-such-program-xyz"));
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("expected a spawn error, got {other:?}"),
    }
}

#[test]
fn status_errors_name_the_expression() {
    let err = cmd("false", None::<&str>).run().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cmd(\"false\")"), "{message}");
    assert!(message.contains("status 1"), "{message}");
}
