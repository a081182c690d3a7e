//! Deferred and delayed callback execution tied to the I/O runtime.
//!
//! Cancellation is the load bearing part of this module: a dropped or
//! cancelled [`Handle`] aborts the pending task, which drops the
//! callback and therefore releases everything the callback captured.
//! Connection teardown relies on this to avoid keeping dead
//! connections alive through their own timers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{select, Either};
use futures_timer::Delay;

use crate::p2p::async_runtime as rt;
use crate::p2p::error::*;

/// Schedules callbacks onto the runtime the caller lives on.
#[derive(Clone, Default)]
pub struct Scheduler;

/// A cancellable handle to one scheduled callback.
///
/// Dropping the handle cancels the callback. A cancel that races the
/// callback's own execution is a no-op.
pub struct Handle {
    cancelled: Arc<AtomicBool>,
    task: Option<rt::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler
    }

    /// Runs `f` at the next runtime iteration.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        rt::spawn(async move {
            rt::yield_now().await;
            f();
        });
    }

    /// Runs `f` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = rt::spawn(async move {
            Delay::new(delay).await;
            if !flag.load(Ordering::SeqCst) {
                f();
            }
        });
        Handle {
            cancelled,
            task: Some(task),
        }
    }

    /// Runs `f` every `period` until the handle is cancelled.
    pub fn schedule_repeating<F>(&self, period: Duration, f: F) -> Handle
    where
        F: Fn() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = rt::spawn(async move {
            loop {
                Delay::new(period).await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                f();
            }
        });
        Handle {
            cancelled,
            task: Some(task),
        }
    }
}

impl Handle {
    /// Prevents the callback from firing. The entry is removed right
    /// away so anything it captured is released.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Resolves `future`, or fails with `ErrorKind::Timeout` after
/// `duration`.
pub async fn timeout<F>(duration: Duration, future: F) -> Result<F::Output>
where
    F: Future,
{
    futures::pin_mut!(future);
    let delay = Delay::new(duration);
    match select(future, delay).await {
        Either::Left((value, _)) => Ok(value),
        Either::Right(((), _)) => Err(Error::simple(ErrorKind::Timeout)),
    }
}
