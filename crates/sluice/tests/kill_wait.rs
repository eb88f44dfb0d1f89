#![cfg(unix)]
//! Handle lifecycle: kill, wait, try_wait, pids, and partial-start cleanup.

mod support;

use anyhow::Result;
use sluice::cmd;
use std::thread;
use std::time::Duration;
use support::sh;

const SIGKILL_STATUS: i32 = 128 + libc::SIGKILL;

#[test]
fn kill_then_wait_reports_the_signal() -> Result<()> {
    let handle = cmd("sleep", ["60"]).unchecked().start()?;
    handle.kill()?;
    let output = handle.wait()?;
    assert_eq!(output.status, SIGKILL_STATUS);
    Ok(())
}

#[test]
fn kill_is_idempotent() -> Result<()> {
    let handle = cmd("sleep", ["60"]).unchecked().start()?;
    handle.kill()?;
    handle.kill()?;
    handle.wait()?;
    // And harmless after the children are reaped.
    handle.kill()?;
    Ok(())
}

#[test]
fn try_wait_polls_without_blocking() -> Result<()> {
    let handle = cmd("sleep", ["60"]).unchecked().start()?;
    assert!(handle.try_wait()?.is_none());
    handle.kill()?;
    let status = loop {
        if let Some(output) = handle.try_wait()? {
            break output.status;
        }
        thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(status, SIGKILL_STATUS);
    Ok(())
}

#[test]
fn kill_concurrent_with_wait() -> Result<()> {
    let handle = cmd("sleep", ["60"]).unchecked().start()?;
    thread::scope(|scope| -> Result<()> {
        let waiter = scope.spawn(|| handle.wait().map(|output| output.status));
        // Let the waiter block inside the child wait before killing.
        thread::sleep(Duration::from_millis(50));
        handle.kill()?;
        let status = waiter.join().expect("waiter panicked")?;
        assert_eq!(status, SIGKILL_STATUS);
        Ok(())
    })
}

#[test]
fn wait_from_multiple_threads_sees_one_output() -> Result<()> {
    let handle = sh("sleep 0.2; echo done").stdout_capture().start()?;
    let results = thread::scope(|scope| {
        let waiters: Vec<_> = (0..3)
            .map(|_| scope.spawn(|| handle.wait().map(|output| output.clone())))
            .collect();
        waiters
            .into_iter()
            .map(|waiter| waiter.join().expect("waiter panicked"))
            .collect::<Vec<_>>()
    });
    for result in results {
        let output = result?;
        assert_eq!(output.status, 0);
        assert_eq!(output.stdout.as_deref(), Some(b"done\n".as_slice()));
    }
    Ok(())
}

#[test]
fn pids_lists_live_leaves_in_pipeline_order() -> Result<()> {
    let handle = cmd("sleep", ["60"])
        .pipe(&cmd("sleep", ["60"]))
        .unchecked()
        .start()?;
    let pids = handle.pids();
    assert_eq!(pids.len(), 2);
    assert_ne!(pids[0], pids[1]);
    handle.kill()?;
    handle.wait()?;
    assert!(handle.pids().is_empty());
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn failed_start_leaves_no_processes_behind() -> Result<()> {
    let marker = "sluice-partial-start-marker";
    let left = sh(&format!("sleep 60 && : {marker}"));
    let err = left
        .pipe(&cmd("sluice-no-such-program-xyz", None::<&str>))
        .start()
        .unwrap_err();
    assert!(matches!(err, sluice::Error::Spawn { .. }));
    // The left sleep was killed and reaped before start returned, so no
    // process with the marker argument can still exist.
    assert!(!proc_cmdline_contains(marker)?);
    Ok(())
}

/// Scan /proc for a live process whose command line contains `marker`.
#[cfg(target_os = "linux")]
fn proc_cmdline_contains(marker: &str) -> Result<bool> {
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) {
            if String::from_utf8_lossy(&cmdline).contains(marker) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
