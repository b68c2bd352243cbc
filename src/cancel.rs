//! Cancellation token checked at every suspension point.

use crate::Error;
use std::sync::{Arc, Mutex};
use std::task::{Context, Waker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reason {
    /// Explicit cancel by the caller.
    User,
    /// A deadline tripped by the caller's timer.
    Deadline,
}

/// Shared cancellation token.
///
/// The crate prescribes no async runtime, so deadlines are the caller's
/// business: race your timer against the operation and call [`expire`]
/// when it fires. Both flavors abort the pending operation at its next
/// poll; the owning connection is discarded, never pooled.
///
/// [`expire`]: Cancel::expire
#[derive(Clone)]
pub struct Cancel {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    reason: Option<Reason>,
    wakers: Vec<Waker>,
}

impl Cancel {
    pub fn new() -> Self {
        Cancel {
            inner: Arc::new(Mutex::new(Inner {
                reason: None,
                wakers: Vec::new(),
            })),
        }
    }

    /// Cancel the operation. Classifies as `Error::Canceled`.
    pub fn cancel(&self) {
        self.trip(Reason::User);
    }

    /// Expire the operation's deadline. Classifies as `Error::Timeout`.
    pub fn expire(&self) {
        self.trip(Reason::Deadline);
    }

    pub fn is_tripped(&self) -> bool {
        let lock = self.inner.lock().unwrap();
        lock.reason.is_some()
    }

    fn trip(&self, reason: Reason) {
        let mut lock = self.inner.lock().unwrap();

        // first trip wins the classification.
        if lock.reason.is_none() {
            lock.reason = Some(reason);
        }

        for w in lock.wakers.drain(..) {
            w.wake();
        }
    }

    /// Registers the current task and errors if already tripped. Called at
    /// the top of every poll loop so a trip wakes the task and the next
    /// poll bails out.
    pub(crate) fn check(&self, cx: &mut Context) -> Result<(), Error> {
        let mut lock = self.inner.lock().unwrap();

        match lock.reason {
            Some(Reason::User) => Err(Error::Canceled),
            Some(Reason::Deadline) => Err(Error::Timeout),
            None => {
                lock.wakers.push(cx.waker().clone());
                Ok(())
            }
        }
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Cancel::new()
    }
}

impl std::fmt::Debug for Cancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lock = self.inner.lock().unwrap();
        write!(f, "Cancel({:?})", lock.reason)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures_util::task::noop_waker;

    #[test]
    fn first_trip_wins() {
        let c = Cancel::new();
        c.expire();
        c.cancel();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        match c.check(&mut cx) {
            Err(Error::Timeout) => {}
            r => panic!("wrong classification: {:?}", r),
        }
    }

    #[test]
    fn untripped_is_ok() {
        let c = Cancel::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(c.check(&mut cx).is_ok());
        assert!(!c.is_tripped());
    }
}
