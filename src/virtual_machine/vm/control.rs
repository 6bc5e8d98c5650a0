use crate::virtual_machine::vm::Interrupt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct ControlState {
    paused: bool,
    yielded: bool,
    terminated: bool,
    yield_suspends: bool,
    pending: VecDeque<Interrupt>,
}

impl ControlState {
    fn needs_attention(&self) -> bool {
        self.paused || self.yielded || self.terminated || !self.pending.is_empty()
    }
}

#[derive(Default)]
struct Shared {
    /// Fast-path copy of `ControlState::needs_attention`, read every instruction.
    attention: AtomicBool,
    state: Mutex<ControlState>,
    wake: Condvar,
}

/// What the execution loop should do after a control checkpoint.
pub(crate) enum Checkpoint {
    Terminate,
    Continue(Vec<Interrupt>),
}

/// Thread-safe handle for steering a running VM from the host.
///
/// Obtained from [`Vm::handle`](super::Vm::handle). Every method may be called
/// from any thread; requests take effect between two instructions.
#[derive(Clone, Default)]
pub struct VmHandle {
    shared: Arc<Shared>,
}

impl VmHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends execution before the next instruction.
    pub fn pause(&self) {
        self.update(|s| s.paused = true);
    }

    /// Resumes a VM suspended by [`pause`](Self::pause) or by `YIELD`.
    pub fn resume(&self) {
        self.update(|s| {
            s.paused = false;
            s.yielded = false;
        });
    }

    /// Stops the VM; a paused VM is woken so that it can exit.
    pub fn terminate(&self) {
        self.update(|s| s.terminated = true);
    }

    /// Controls whether the `YIELD` instruction suspends the VM.
    pub fn set_yield_suspends(&self, suspends: bool) {
        self.update(|s| s.yield_suspends = suspends);
    }

    /// Queues an interrupt for delivery before the next instruction.
    pub fn raise(&self, interrupt: Interrupt) {
        self.update(|s| s.pending.push_back(interrupt));
    }

    /// Returns true while the VM is suspended by a pause or a yield.
    pub fn is_paused(&self) -> bool {
        let state = self.lock();
        state.paused || state.yielded
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    #[inline(always)]
    pub(crate) fn needs_attention(&self) -> bool {
        self.shared.attention.load(Ordering::Acquire)
    }

    /// Blocks while suspended, then reports termination or hands over pending interrupts.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let mut state = self.lock();
        while (state.paused || state.yielded) && !state.terminated {
            state = self
                .shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.terminated {
            return Checkpoint::Terminate;
        }
        let pending = state.pending.drain(..).collect();
        self.shared
            .attention
            .store(state.needs_attention(), Ordering::Release);
        Checkpoint::Continue(pending)
    }

    /// Records a `YIELD`. Returns true if the VM should suspend.
    pub(crate) fn yielded(&self) -> bool {
        let mut state = self.lock();
        if !state.yield_suspends {
            return false;
        }
        state.yielded = true;
        self.shared.attention.store(true, Ordering::Release);
        true
    }

    fn update(&self, f: impl FnOnce(&mut ControlState)) {
        let mut state = self.lock();
        f(&mut state);
        self.shared
            .attention
            .store(state.needs_attention(), Ordering::Release);
        self.shared.wake.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn attention_follows_requests() {
        let handle = VmHandle::new();
        assert!(!handle.needs_attention());
        handle.raise(Interrupt::KeyPress);
        assert!(handle.needs_attention());
        match handle.checkpoint() {
            Checkpoint::Continue(pending) => assert_eq!(pending, vec![Interrupt::KeyPress]),
            Checkpoint::Terminate => panic!("unexpected terminate"),
        }
        assert!(!handle.needs_attention());
    }

    #[test]
    fn yield_only_suspends_when_enabled() {
        let handle = VmHandle::new();
        assert!(!handle.yielded());
        handle.set_yield_suspends(true);
        assert!(handle.yielded());
        assert!(handle.is_paused());
        handle.resume();
        assert!(!handle.is_paused());
    }

    #[test]
    fn terminate_wakes_paused_checkpoint() {
        let handle = VmHandle::new();
        handle.pause();
        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || matches!(handle.checkpoint(), Checkpoint::Terminate))
        };
        thread::sleep(Duration::from_millis(20));
        handle.terminate();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn resume_wakes_paused_checkpoint() {
        let handle = VmHandle::new();
        handle.pause();
        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || matches!(handle.checkpoint(), Checkpoint::Continue(_)))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        handle.resume();
        assert!(waiter.join().unwrap());
    }
}
