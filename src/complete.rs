//! Single-assignment completion cell.

use crate::Error;
use futures_util::future::poll_fn;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A single-assignment result slot bridging "an operation completes
/// somewhere else" into an awaitable outcome.
///
/// Exactly one of [`try_complete`], [`try_cancel`] or [`try_fault`] wins;
/// the losers are no-ops that report the loss. [`wait`] observes the
/// outcome once, re-raising a fault with its original classification.
///
/// Inside the crate this is the pool's waiter handoff cell: a released
/// connection is `try_complete`d into the next queued waiter, and a waiter
/// that gives up `try_cancel`s its own cell so the release path skips it.
///
/// [`try_complete`]: Completion::try_complete
/// [`try_cancel`]: Completion::try_cancel
/// [`try_fault`]: Completion::try_fault
/// [`wait`]: Completion::wait
pub struct Completion<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion {
            inner: self.inner.clone(),
        }
    }
}

enum State<T> {
    Running,
    /// `None` once the value has been taken by `wait`.
    Completed(Option<T>),
    Canceled,
    /// `None` once the fault has been re-raised.
    Faulted(Option<Error>),
}

struct Inner<T> {
    state: State<T>,
    wakers: Vec<Waker>,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Completion {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Running,
                wakers: Vec::new(),
            })),
        }
    }

    pub fn is_running(&self) -> bool {
        let lock = self.inner.lock().unwrap();
        match lock.state {
            State::Running => true,
            _ => false,
        }
    }

    /// Resolve with a value. Loses (returning the value back) if the cell
    /// is no longer running.
    pub fn try_complete(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock().unwrap();

        match lock.state {
            State::Running => {
                lock.state = State::Completed(Some(value));
                lock.wake_all();
                Ok(())
            }
            _ => Err(value),
        }
    }

    /// Resolve as canceled. Returns whether this call won.
    pub fn try_cancel(&self) -> bool {
        let mut lock = self.inner.lock().unwrap();

        match lock.state {
            State::Running => {
                lock.state = State::Canceled;
                lock.wake_all();
                true
            }
            _ => false,
        }
    }

    /// Resolve with a fault. Returns whether this call won.
    pub fn try_fault(&self, error: Error) -> bool {
        let mut lock = self.inner.lock().unwrap();

        match lock.state {
            State::Running => {
                lock.state = State::Faulted(Some(error));
                lock.wake_all();
                true
            }
            _ => false,
        }
    }

    /// Non-blocking grab of a completed value, used to reclaim a handoff
    /// that raced with cancellation.
    pub fn take_now(&self) -> Option<T> {
        let mut lock = self.inner.lock().unwrap();

        match &mut lock.state {
            State::Completed(v) => v.take(),
            _ => None,
        }
    }

    pub fn poll_wait(&self, cx: &mut Context) -> Poll<Result<T, Error>> {
        let mut lock = self.inner.lock().unwrap();

        match &mut lock.state {
            State::Running => {
                lock.wakers.push(cx.waker().clone());
                Poll::Pending
            }
            State::Completed(v) => match v.take() {
                Some(v) => Ok(v).into(),
                None => Err(Error::User("Completion consumed twice".into())).into(),
            },
            State::Canceled => Err(Error::Canceled).into(),
            State::Faulted(e) => match e.take() {
                Some(e) => Err(e).into(),
                None => Err(Error::User("Completion consumed twice".into())).into(),
            },
        }
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> Result<T, Error> {
        poll_fn(|cx| self.poll_wait(cx)).await
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Completion::new()
    }
}

impl<T> Inner<T> {
    fn wake_all(&mut self) {
        for w in self.wakers.drain(..) {
            w.wake();
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lock = self.inner.lock().unwrap();
        let s = match &lock.state {
            State::Running => "Running",
            State::Completed(_) => "Completed",
            State::Canceled => "Canceled",
            State::Faulted(_) => "Faulted",
        };
        write!(f, "Completion({})", s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exactly_one_resolution_wins() {
        let c: Completion<u32> = Completion::new();

        assert!(c.try_complete(1).is_ok());
        assert_eq!(c.try_complete(2), Err(2));
        assert!(!c.try_cancel());
        assert!(!c.try_fault(Error::Timeout));
    }

    #[test]
    fn cancel_blocks_later_completion() {
        let c: Completion<u32> = Completion::new();

        assert!(c.try_cancel());
        assert_eq!(c.try_complete(1), Err(1));
        assert!(c.take_now().is_none());
    }

    #[test]
    fn fault_classification_preserved() {
        let c: Completion<u32> = Completion::new();
        assert!(c.try_fault(Error::Timeout));

        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        match c.poll_wait(&mut cx) {
            Poll::Ready(Err(Error::Timeout)) => {}
            r => panic!("wrong outcome: {:?}", r.map(|v| v.map(|_| ()))),
        }
    }

    #[test]
    fn take_now_reclaims_lost_handoff() {
        let c: Completion<u32> = Completion::new();
        assert!(c.try_complete(7).is_ok());

        // cancel lost the race, the value is still there to reclaim.
        assert!(!c.try_cancel());
        assert_eq!(c.take_now(), Some(7));
        assert_eq!(c.take_now(), None);
    }

    #[async_std::test]
    async fn wait_sees_value_set_from_elsewhere() {
        let c: Completion<&'static str> = Completion::new();
        let c2 = c.clone();

        async_std::task::spawn(async move {
            c2.try_complete("done").ok();
        });

        assert_eq!(c.wait().await.unwrap(), "done");
    }
}
