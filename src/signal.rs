//! One-shot init-completion signalling shared by the update processors.
use std::sync::{Condvar, Mutex};

use crate::{Error, Result};

/// Records the first success or terminal failure of an update processor
/// and wakes any thread blocked waiting for it. Later outcomes are
/// ignored, so the completion callback semantics are exactly-once.
pub(crate) struct InitSignal {
    slot: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl InitSignal {
    pub fn new() -> InitSignal {
        InitSignal {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Offer an outcome. Returns whether this was the first one.
    pub fn offer(&self, outcome: Result<()>) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.cond.notify_all();
        true
    }

    /// Whether a successful outcome has been recorded.
    pub fn ready(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| matches!(&*slot, Some(Ok(()))))
            .unwrap_or(false)
    }

    /// Block until an outcome is recorded and return it.
    pub fn wait(&self) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| Error::ProcessorPanicked)?;
        loop {
            match &*slot {
                Some(outcome) => return outcome.clone(),
                None => {
                    slot = self
                        .cond
                        .wait(slot)
                        .map_err(|_| Error::ProcessorPanicked)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::InitSignal;
    use crate::Error;

    #[test]
    fn first_outcome_wins() {
        let signal = InitSignal::new();
        assert!(signal.offer(Ok(())));
        assert!(!signal.offer(Err(Error::Unauthorized)));
        assert!(signal.ready());
        assert!(signal.wait().is_ok());
    }

    #[test]
    fn failure_outcome_is_not_ready() {
        let signal = InitSignal::new();
        signal.offer(Err(Error::Unauthorized));
        assert!(!signal.ready());
        assert!(matches!(signal.wait(), Err(Error::Unauthorized)));
    }

    #[test]
    fn wait_blocks_until_offered() {
        let signal = Arc::new(InitSignal::new());
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        signal.offer(Ok(()));
        assert!(waiter.join().unwrap().is_ok());
    }
}
