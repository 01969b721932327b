use std::sync::atomic::{AtomicU64, Ordering};

/// Lamport logical clock shared between the command loop and the feed
/// listener.
///
/// Every outbound request is stamped with the value returned by [`tick`],
/// and every inbound stamp is folded back in through [`observe`], giving a
/// consistent partial order over events without synchronized wall clocks.
/// Both operations are atomic, so the two tasks never race on the counter.
///
/// [`tick`]: LamportClock::tick
/// [`observe`]: LamportClock::observe
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances local time by one step and returns the new value.
    ///
    /// Called exactly once per outbound request, immediately before the
    /// request is serialized.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Folds an inbound stamp into local time.
    ///
    /// The counter becomes `max(local, external) + 1`, so time after a
    /// receive always exceeds both the sender's stamp and our own prior
    /// value. Observing the same stamp twice still advances the clock.
    pub fn observe(&self, external: u64) -> u64 {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            let next = current.max(external) + 1;
            match self.counter.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current value without advancing time.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}
