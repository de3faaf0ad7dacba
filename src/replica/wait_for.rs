use crate::api::ReplicatedLogError;
use crate::replica::LogIndex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// LogFuture resolves once the log has done what was asked: persisted a write, committed an
/// index, applied an index. Dropping the future doesn't cancel the work.
///
/// If the side that was supposed to resolve the future goes away first (e.g. the participant
/// resigned and was dropped), the future resolves to [`ReplicatedLogError::Cancelled`].
pub struct LogFuture<T> {
    rx: oneshot::Receiver<Result<T, ReplicatedLogError>>,
}

impl<T> LogFuture<T> {
    pub(crate) fn new() -> (Callback<T>, LogFuture<T>) {
        let (tx, rx) = oneshot::channel();
        (Callback(tx), LogFuture { rx })
    }

    pub(crate) fn ready(result: Result<T, ReplicatedLogError>) -> Self {
        let (callback, future) = Self::new();
        callback.send(result);
        future
    }
}

impl<T> Future for LogFuture<T> {
    type Output = Result<T, ReplicatedLogError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ReplicatedLogError::Cancelled)))
    }
}

impl<T> fmt::Debug for LogFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogFuture")
    }
}

pub(crate) struct Callback<T>(oneshot::Sender<Result<T, ReplicatedLogError>>);

impl<T> Callback<T> {
    pub(crate) fn send(self, result: Result<T, ReplicatedLogError>) {
        // The waiter may have lost interest. That's fine.
        let _ = self.0.send(result);
    }
}

/// WaitForQueue holds everyone waiting for the log to reach some index.
pub(crate) struct WaitForQueue<T> {
    waiters: BTreeMap<LogIndex, Vec<Callback<T>>>,
}

impl<T: Clone> WaitForQueue<T> {
    pub(crate) fn new() -> Self {
        WaitForQueue {
            waiters: BTreeMap::new(),
        }
    }

    pub(crate) fn wait_for(&mut self, index: LogIndex) -> LogFuture<T> {
        let (callback, future) = LogFuture::new();
        self.waiters.entry(index).or_insert_with(Vec::new).push(callback);
        future
    }

    /// Resolves every waiter with an index `<= index`.
    pub(crate) fn resolve_up_to(&mut self, index: LogIndex, value: T) {
        let remaining = self.waiters.split_off(&index.plus(1));
        let resolved = std::mem::replace(&mut self.waiters, remaining);
        for callback in resolved.into_values().flatten() {
            callback.send(Ok(value.clone()));
        }
    }

    pub(crate) fn fail_all(&mut self, error: ReplicatedLogError) {
        for callback in std::mem::take(&mut self.waiters).into_values().flatten() {
            callback.send(Err(error.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}
