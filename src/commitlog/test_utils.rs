use crate::commitlog::{
    InMemoryPersistedLog, PersistedLog, PersistedLogIterator, PersistedStateInfo, SequenceNumber, StorageError,
    WriteOptions,
};
use crate::replica::{LogId, LogIndex, PersistingLogEntry};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// DelayedPersistedLog holds every write until the test lets it through (or fails it) via the
/// paired [`WriteController`]. Reads go straight to the wrapped log.
pub(crate) struct DelayedPersistedLog {
    inner: InMemoryPersistedLog,
    pending: mpsc::UnboundedSender<PendingWrite>,
}

pub(crate) struct WriteController {
    pending: mpsc::UnboundedReceiver<PendingWrite>,
}

pub(crate) struct PendingWrite {
    pub(crate) description: String,
    release: oneshot::Sender<Result<(), StorageError>>,
}

impl PendingWrite {
    pub(crate) fn succeed(self) {
        let _ = self.release.send(Ok(()));
    }

    pub(crate) fn fail(self, error: StorageError) {
        let _ = self.release.send(Err(error));
    }
}

impl WriteController {
    pub(crate) async fn next_pending(&mut self) -> PendingWrite {
        tokio::time::timeout(Duration::from_secs(5), self.pending.recv())
            .await
            .expect("Unexpected timeout waiting for a write")
            .expect("Delayed log was dropped")
    }
}

impl DelayedPersistedLog {
    pub(crate) fn wrap(inner: InMemoryPersistedLog) -> (Self, WriteController) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DelayedPersistedLog { inner, pending: tx }, WriteController { pending: rx })
    }

    async fn gate(&self, description: String) -> Result<(), StorageError> {
        let (release, released) = oneshot::channel();
        self.pending
            .send(PendingWrite { description, release })
            .map_err(|_| StorageError::Engine("Write controller dropped".into()))?;
        released
            .await
            .map_err(|_| StorageError::Engine("Pending write dropped".into()))?
    }
}

#[async_trait]
impl PersistedLog for DelayedPersistedLog {
    fn log_id(&self) -> LogId {
        self.inner.log_id()
    }

    fn object_id(&self) -> u64 {
        self.inner.object_id()
    }

    fn read_metadata(&self) -> Result<PersistedStateInfo, StorageError> {
        self.inner.read_metadata()
    }

    fn update_metadata(&mut self, info: PersistedStateInfo) -> Result<(), StorageError> {
        self.inner.update_metadata(info)
    }

    fn read(&self, first: LogIndex) -> Result<PersistedLogIterator, StorageError> {
        self.inner.read(first)
    }

    async fn insert(
        &mut self,
        entries: Vec<PersistingLogEntry>,
        options: WriteOptions,
    ) -> Result<SequenceNumber, StorageError> {
        self.gate(format!("insert {} entries", entries.len())).await?;
        self.inner.insert(entries, options).await
    }

    async fn remove_front(&mut self, stop: LogIndex, options: WriteOptions) -> Result<SequenceNumber, StorageError> {
        self.gate(format!("remove front {:?}", stop)).await?;
        self.inner.remove_front(stop, options).await
    }

    async fn remove_back(&mut self, start: LogIndex, options: WriteOptions) -> Result<SequenceNumber, StorageError> {
        self.gate(format!("remove back {:?}", start)).await?;
        self.inner.remove_back(start, options).await
    }

    fn synced_sequence_number(&self) -> SequenceNumber {
        self.inner.synced_sequence_number()
    }
}
