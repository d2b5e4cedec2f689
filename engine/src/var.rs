use parking_lot::{Condvar, Mutex};

use crate::{EngineErr, Result};

#[derive(Debug, Default)]
struct VarState {
    issued: u64,
    served: u64,
    pending_reads: usize,
    pending_writes: usize,
    err: Option<EngineErr>,
}

/// The dependency variable of a tensor storage.
///
/// Every asynchronous access takes a ticket at schedule time, accesses run in ticket
/// order. Synchronous readers wait for the pending writes, synchronous writers for
/// every pending access.
#[derive(Debug, Default)]
pub(crate) struct Var {
    state: Mutex<VarState>,
    cond: Condvar,
}

impl Var {
    /// Registers a pending access and returns its ticket.
    ///
    /// # Arguments
    /// * `write` - Whether the access mutates the storage.
    pub fn issue(&self, write: bool) -> u64 {
        let mut state = self.state.lock();

        if write {
            state.pending_writes += 1;
        } else {
            state.pending_reads += 1;
        }

        let ticket = state.issued;
        state.issued += 1;
        ticket
    }

    /// Whether the access holding `ticket` is the next one to run.
    pub fn is_turn(&self, ticket: u64) -> bool {
        self.state.lock().served == ticket
    }

    /// Finishes the access currently being served.
    ///
    /// # Arguments
    /// * `write` - Whether the finished access mutated the storage.
    /// * `err` - The outcome of a write, replaces the recorded error.
    pub fn complete(&self, write: bool, err: Option<EngineErr>) {
        let mut state = self.state.lock();
        state.served += 1;

        if write {
            state.pending_writes -= 1;
            state.err = err;
        } else {
            state.pending_reads -= 1;
        }

        self.cond.notify_all();
    }

    /// Blocks until every pending write finished.
    ///
    /// # Returns
    /// The error recorded by the last failed write, if any.
    pub fn wait_to_read(&self) -> Result<()> {
        let mut state = self.state.lock();

        while state.pending_writes > 0 {
            self.cond.wait(&mut state);
        }

        match &state.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Blocks until every pending access finished.
    pub fn wait_to_write(&self) {
        let mut state = self.state.lock();

        while state.pending_writes > 0 || state.pending_reads > 0 {
            self.cond.wait(&mut state);
        }
    }

    pub fn error(&self) -> Option<EngineErr> {
        self.state.lock().err.clone()
    }

    pub fn clear_error(&self) {
        self.state.lock().err = None;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn tickets_are_served_in_order() {
        let var = Var::default();
        let first = var.issue(true);
        let second = var.issue(false);

        assert!(var.is_turn(first));
        assert!(!var.is_turn(second));

        var.complete(true, None);
        assert!(var.is_turn(second));
    }

    #[test]
    fn failed_write_surfaces_on_read() {
        let var = Var::default();
        var.issue(true);
        var.complete(true, Some(EngineErr::Op("boom".into())));

        assert_eq!(var.wait_to_read(), Err(EngineErr::Op("boom".into())));

        var.clear_error();
        assert_eq!(var.wait_to_read(), Ok(()));
    }

    #[test]
    fn reader_waits_for_pending_write() {
        let var = Arc::new(Var::default());
        var.issue(true);

        let writer = {
            let var = var.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                var.complete(true, None);
            })
        };

        var.wait_to_read().unwrap();
        assert!(var.is_turn(1));
        writer.join().unwrap();
    }
}
