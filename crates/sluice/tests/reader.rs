#![cfg(unix)]
//! The streaming reader surface: EOF semantics, error surfacing, teardown.

mod support;

use anyhow::Result;
use sluice::cmd;
use std::io::Read;
use support::sh;

#[test]
fn reader_streams_stdout() -> Result<()> {
    let mut reader = cmd("echo", ["hi"]).reader()?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    assert_eq!(bytes, b"hi\n");
    // Past EOF the reader keeps returning zero.
    let mut more = [0u8; 8];
    assert_eq!(reader.read(&mut more)?, 0);
    Ok(())
}

#[test]
fn reader_surfaces_checked_failures_at_eof() -> Result<()> {
    let mut reader = cmd("false", None::<&str>).reader()?;
    let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
    // The status error rides inside the io::Error.
    assert!(err.to_string().contains("status 1"), "{err}");
    Ok(())
}

#[test]
fn unchecked_reader_reaches_quiet_eof() -> Result<()> {
    let mut reader = cmd("false", None::<&str>).unchecked().reader()?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    assert!(bytes.is_empty());
    Ok(())
}

#[test]
fn dropping_a_reader_kills_and_reaps() -> Result<()> {
    let reader = sh("sleep 60").reader()?;
    let pids = reader.pids();
    assert_eq!(pids.len(), 1);
    let pid = pids[0] as i32;
    drop(reader);
    // Reaped means the PID is no longer our child: waitpid must refuse it.
    let mut status = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    let errno = std::io::Error::last_os_error();
    assert_eq!(rc, -1);
    assert_eq!(errno.raw_os_error(), Some(libc::ECHILD));
    Ok(())
}

#[test]
fn reader_try_wait_reports_no_stdout() -> Result<()> {
    let mut reader = cmd("echo", ["hi"]).reader()?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let output = reader.try_wait()?.expect("already finished").clone();
    // The reader owns the stdout pipe; the output never carries those bytes.
    assert!(output.stdout.is_none());
    assert!(output.success());
    Ok(())
}

#[test]
fn kill_unblocks_a_reader() -> Result<()> {
    let mut reader = sh("echo started; sleep 60").unchecked().reader()?;
    let mut first = [0u8; 8];
    reader.read_exact(&mut first)?;
    assert_eq!(&first, b"started\n");
    reader.kill()?;
    // The killed child closes its end; EOF follows, quietly (unchecked).
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest)?;
    assert!(rest.is_empty());
    Ok(())
}

#[test]
fn reader_works_through_a_pipeline() -> Result<()> {
    let mut reader = cmd("echo", ["hi"]).pipe(&cmd("sed", ["s/i/o/"])).reader()?;
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    assert_eq!(text, "ho\n");
    Ok(())
}
