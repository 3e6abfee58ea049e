//! Process identity for the in-file writer lock.
//!
//! The writer lock stored in an index header records the owning process as
//! `(pid, start-time stamp)`. Deciding whether a lock is stale requires
//! asking the OS for the start time of an arbitrary pid; [`ProcessClock`]
//! abstracts that lookup so tests can inject deterministic values.

/// Capability to identify the current process and probe others.
pub trait ProcessClock {
    /// Pid of the calling process.
    fn pid(&self) -> u32;

    /// Start-time stamp of `pid`, or `None` when no such process exists.
    ///
    /// The stamp only has to be stable for the lifetime of one process
    /// incarnation and different across incarnations of the same pid.
    fn start_time(&self, pid: u32) -> Option<u64>;
}

/// The real OS clock. On Linux the start time is field 22 of
/// `/proc/<pid>/stat` (clock ticks since boot).
pub struct SystemClock;

impl ProcessClock for SystemClock {
    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        // The comm field may contain spaces and parentheses; fields are
        // only well-delimited after the last ')'.
        let rest = stat.rsplit_once(')')?.1;
        rest.split_whitespace().nth(19)?.parse().ok()
    }
}

/// Outcome of probing a stored writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockProbe {
    /// No lock recorded.
    Unlocked,
    /// The recorded owner is dead or was reincarnated; the lock may be
    /// stolen.
    Stale,
    /// The recorded owner is alive with a matching start time.
    Held,
}

/// Classify the `(pid, stamp)` pair stored in a header.
pub fn probe_lock(clock: &dyn ProcessClock, pid: u32, stamp: u64) -> LockProbe {
    if pid == 0 {
        return LockProbe::Unlocked;
    }
    match clock.start_time(pid) {
        None => LockProbe::Stale,
        Some(t) if t != stamp => LockProbe::Stale,
        Some(_) => LockProbe::Held,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_probe_unlocked() {
        let clock = FakeClock { pid: 10, alive: vec![] };
        assert_eq!(probe_lock(&clock, 0, 0), LockProbe::Unlocked);
    }

    #[test]
    fn test_probe_dead_owner_is_stale() {
        let clock = FakeClock { pid: 10, alive: vec![] };
        assert_eq!(probe_lock(&clock, 99, 1234), LockProbe::Stale);
    }

    #[test]
    fn test_probe_reincarnated_pid_is_stale() {
        let clock = FakeClock { pid: 10, alive: vec![(99, 5678)] };
        assert_eq!(probe_lock(&clock, 99, 1234), LockProbe::Stale);
    }

    #[test]
    fn test_probe_live_owner_is_held() {
        let clock = FakeClock { pid: 10, alive: vec![(99, 1234)] };
        assert_eq!(probe_lock(&clock, 99, 1234), LockProbe::Held);
    }

    #[test]
    fn test_system_clock_sees_self() {
        let clock = SystemClock;
        let me = clock.pid();
        assert!(clock.start_time(me).is_some());
    }
}
