//! Process identity and state, just far enough to give the IPC layer
//! somewhere to look up a destination and somewhere to block.
//!
//! The scheduler itself, context switching, and real PID allocation are
//! out of scope here — those live in a separate subsystem. What's
//! below is the minimal stand-in that subsystem is expected to satisfy:
//! a state table `set_state`/`state_of` can read and write, and a
//! cooperative `yield_now` that hands control to whatever scheduler is
//! plugged in.

use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

pub const PROCESS_MAX: usize = 64;

pub type Pid = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Invalid,
    Ready,
    Running,
    Blocked,
    Terminated,
}

static STATES: Mutex<[ProcessState; PROCESS_MAX]> = Mutex::new([ProcessState::Invalid; PROCESS_MAX]);
static CURRENT_PID: AtomicU32 = AtomicU32::new(1);

/// # Safety
/// Must run once during process-table bring-up, before any IPC calls.
pub unsafe fn init() {
    let mut states = STATES.lock();
    states[1] = ProcessState::Running;
}

pub fn current_pid() -> Pid {
    CURRENT_PID.load(Ordering::Relaxed)
}

/// Test/bring-up hook: not part of the external scheduler contract.
pub fn set_current_pid(pid: Pid) {
    CURRENT_PID.store(pid, Ordering::Relaxed);
}

pub fn exists(pid: Pid) -> bool {
    (pid as usize) < PROCESS_MAX && state_of(pid) != ProcessState::Invalid
}

pub fn state_of(pid: Pid) -> ProcessState {
    if (pid as usize) >= PROCESS_MAX {
        return ProcessState::Invalid;
    }
    STATES.lock()[pid as usize]
}

pub fn set_state(pid: Pid, state: ProcessState) {
    if (pid as usize) >= PROCESS_MAX {
        return;
    }
    STATES.lock()[pid as usize] = state;
}

/// Cooperative yield point. The real scheduler swaps in the next ready
/// process here; without one plugged in, this just gives the CPU a
/// hint and returns, so blocking loops re-check their predicate rather
/// than spinning hot.
pub fn yield_now() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        set_state(5, ProcessState::Ready);
        assert_eq!(state_of(5), ProcessState::Ready);
        assert!(exists(5));
    }

    #[test]
    fn test_invalid_pid_out_of_range() {
        assert_eq!(state_of(999), ProcessState::Invalid);
        assert!(!exists(999));
    }

    #[test]
    fn test_terminated_is_not_invalid_but_excluded_by_callers() {
        set_state(6, ProcessState::Terminated);
        assert_eq!(state_of(6), ProcessState::Terminated);
    }
}
