//! Writer-lock behaviour: mutual exclusion within a live process and
//! stale-lock reclamation after a simulated crash.
//!
//! Crashes are simulated by leaking the engine (`mem::forget`), which
//! skips the close path that clears the in-header lock, and by probing
//! with injected `ProcessClock`s that decide which pids look alive.

use tempfile::tempdir;

use isam::isam::bt64::Bt64;
use isam::isam::ndx::{Ndx, NdxParams};
use isam::isam::process::ProcessClock;
use isam::IsamError;

/// A clock where only the listed `(pid, start_time)` pairs are alive.
struct FakeClock {
    pid: u32,
    alive: Vec<(u32, u64)>,
}

impl ProcessClock for FakeClock {
    fn pid(&self) -> u32 {
        self.pid
    }
    fn start_time(&self, pid: u32) -> Option<u64> {
        self.alive.iter().find(|(p, _)| *p == pid).map(|(_, t)| *t)
    }
}

fn clock(pid: u32, alive: &[(u32, u64)]) -> Box<FakeClock> {
    Box::new(FakeClock { pid, alive: alive.to_vec() })
}

#[test]
fn test_bt64_second_writer_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock.ibt");

    let bt = Bt64::create_with_clock(&path, clock(100, &[(100, 1)])).unwrap();

    // same live process: the lock reads as held
    let err = Bt64::open_with_clock(&path, true, false, clock(100, &[(100, 1)])).unwrap_err();
    assert!(matches!(err, IsamError::WriterLocked(_)));

    // read-only opens are not blocked by the writer lock
    Bt64::open_with_clock(&path, false, false, clock(100, &[(100, 1)])).unwrap();

    drop(bt);
}

#[test]
fn test_bt64_close_releases_the_lock() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock.ibt");

    let mut bt = Bt64::create_with_clock(&path, clock(100, &[(100, 1)])).unwrap();
    bt.push(1, b"x").unwrap();
    bt.close().unwrap();

    let bt = Bt64::open_with_clock(&path, true, false, clock(100, &[(100, 1)])).unwrap();
    assert_eq!(bt.info().wrlock_pid, 100);
}

#[test]
fn test_bt64_stale_lock_is_reclaimed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stale.ibt");

    {
        let mut bt = Bt64::create_with_clock(&path, clock(100, &[(100, 1)])).unwrap();
        bt.push(7, b"payload").unwrap();
        bt.push(8, b"more").unwrap();
        // crash: the header keeps pid 100
        std::mem::forget(bt);
    }

    // pid 100 is gone; a new process reclaims the lock
    let bt = Bt64::open_with_clock(&path, true, false, clock(200, &[(200, 2)])).unwrap();
    assert_eq!(bt.info().wrlock_pid, 200);
    let mut out = Vec::new();
    assert_eq!(bt.fetch(7, &mut out).unwrap(), 7);
    assert_eq!(&out, b"payload");
}

#[test]
fn test_bt64_reincarnated_pid_is_stale() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reinc.ibt");

    {
        let bt = Bt64::create_with_clock(&path, clock(100, &[(100, 1)])).unwrap();
        std::mem::forget(bt);
    }

    // pid 100 exists again with a different start time: still stale
    let bt = Bt64::open_with_clock(&path, true, false, clock(100, &[(100, 9)])).unwrap();
    assert_eq!(bt.info().wrlock_pid, 100);
    assert_eq!(bt.info().wrlock_time, 9);
}

#[test]
fn test_ndx_second_writer_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock.ndx");

    let ndx =
        Ndx::create_with_clock(&path, &NdxParams::default(), clock(100, &[(100, 1)])).unwrap();

    let err = Ndx::open_with_clock(&path, true, clock(100, &[(100, 1)])).unwrap_err();
    assert!(matches!(err, IsamError::WriterLocked(_)));

    Ndx::open_with_clock(&path, false, clock(100, &[(100, 1)])).unwrap();

    drop(ndx);
}

#[test]
fn test_ndx_stale_lock_is_reclaimed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stale.ndx");

    {
        let mut ndx =
            Ndx::create_with_clock(&path, &NdxParams::default(), clock(100, &[(100, 1)])).unwrap();
        ndx.push(b"survivor", b"1234").unwrap();
        std::mem::forget(ndx);
    }

    let ndx = Ndx::open_with_clock(&path, true, clock(200, &[(200, 5)])).unwrap();
    assert_eq!(ndx.info().wrlock_pid, 200);
    let mut out = Vec::new();
    assert_eq!(ndx.fetch(b"survivor", &mut out).unwrap(), 1);
    assert_eq!(&out, b"1234");
}
