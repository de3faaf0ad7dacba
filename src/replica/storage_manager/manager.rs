use crate::api::ReplicatedLogError;
use crate::commitlog::{LogCore, PersistedLog, PersistedStateInfo, SequenceNumber, StorageError, WriteOptions};
use crate::replica::storage_manager::StorageTransaction;
use crate::replica::wait_for::{Callback, LogFuture};
use crate::replica::{InMemoryLog, LogIndex};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// StorageManager is the single writer of a persisted log. Higher layers mutate the log through
/// [`StorageTransaction`]s; every mutation goes into one queue and is applied to storage in
/// submission order, one write at a time.
///
/// The manager keeps two views of the log:
///
/// * spearhead - the log after every submitted operation. New transactions see this.
/// * on disk - the log after every completed operation.
///
/// If a write fails, every operation queued behind it is aborted with
/// [`ReplicatedLogError::Conflict`] (they were computed against a log state that never came to
/// be) and the spearhead falls back to what's on disk.
#[derive(Clone)]
pub(crate) struct StorageManager {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Event>,
    logger: slog::Logger,
}

struct Shared {
    guarded: Mutex<GuardedStorageData>,
}

struct GuardedStorageData {
    spearhead: InMemoryLog,
    on_disk: InMemoryLog,
    info: PersistedStateInfo,
    // Bumped on every failed write. Requests submitted under an older epoch are aborted.
    epoch: u64,
    resigned: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, GuardedStorageData> {
        self.guarded.lock().expect("StorageManager mutex guard poison")
    }

    fn current_epoch(&self) -> u64 {
        self.lock().epoch
    }
}

impl StorageManager {
    /// Loads the log and its metadata from `core` and starts the write queue on the current tokio
    /// runtime.
    pub(crate) fn new(core: LogCore, logger: slog::Logger) -> Result<Self, ReplicatedLogError> {
        let logger = logger.new(slog::o!("LogId" => format!("{:?}", core.log_id())));

        let info = core.persisted().read_metadata()?;
        let entries = core.persisted().read(LogIndex::new(0))?;
        let log = InMemoryLog::from_persisted(entries)
            .ok_or_else(|| StorageError::Engine("Persisted log has gaps".into()))?;
        slog::debug!(logger, "Loaded persisted log {:?}", log.range());

        let shared = Arc::new(Shared {
            guarded: Mutex::new(GuardedStorageData {
                spearhead: log.clone(),
                on_disk: log,
                info,
                epoch: 0,
                resigned: false,
            }),
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = StorageActor {
            receiver,
            persisted: core.into_persisted(),
            shared: shared.clone(),
            logger: logger.clone(),
        };
        tokio::spawn(actor.run_event_loop());

        Ok(StorageManager { shared, sender, logger })
    }

    /// Starts a transaction against the current spearhead. Fails once the manager resigned.
    pub(crate) fn transaction(&self) -> Result<StorageTransaction, ReplicatedLogError> {
        let guard = self.shared.lock();
        if guard.resigned {
            return Err(ReplicatedLogError::Resigned);
        }
        Ok(StorageTransaction::new(self.clone(), guard.spearhead.clone()))
    }

    /// The log as of the last completed write.
    pub(crate) fn committed_log(&self) -> InMemoryLog {
        self.shared.lock().on_disk.clone()
    }

    /// The log as of the last submitted write.
    pub(crate) fn spearhead_log(&self) -> InMemoryLog {
        self.shared.lock().spearhead.clone()
    }

    pub(crate) fn persisted_state_info(&self) -> PersistedStateInfo {
        self.shared.lock().info.clone()
    }

    pub(crate) fn update_persisted_state_info(&self, info: PersistedStateInfo) -> LogFuture<SequenceNumber> {
        self.submit(Operation::UpdateMetadata(info), |log| Ok(log.clone()))
    }

    /// Stops accepting new transactions and hands back the core once everything queued so far
    /// was written. Operations submitted after this point resolve to Cancelled.
    pub(crate) fn resign(&self) -> LogFuture<LogCore> {
        {
            let mut guard = self.shared.lock();
            if guard.resigned {
                return LogFuture::ready(Err(ReplicatedLogError::Resigned));
            }
            guard.resigned = true;
        }
        slog::info!(self.logger, "Resigning storage manager");

        let (callback, future) = LogFuture::new();
        if let Err(mpsc::error::SendError(Event::Resign(callback))) = self.sender.send(Event::Resign(callback)) {
            callback.send(Err(ReplicatedLogError::Cancelled));
        }
        future
    }

    /// Queues `operation`. `apply_to_spearhead` computes what the log looks like after it, or
    /// rejects the operation outright.
    pub(super) fn submit<F>(&self, operation: Operation, apply_to_spearhead: F) -> LogFuture<SequenceNumber>
    where
        F: FnOnce(&InMemoryLog) -> Result<InMemoryLog, ReplicatedLogError>,
    {
        let (callback, future) = LogFuture::new();

        // Held while sending, so queue order and spearhead order are the same.
        let mut guard = self.shared.lock();
        let resulting_log = match apply_to_spearhead(&guard.spearhead) {
            Ok(log) => log,
            Err(e) => {
                slog::warn!(self.logger, "Rejected {:?}: {}", operation, e);
                callback.send(Err(e));
                return future;
            }
        };

        let request = StorageRequest {
            epoch: guard.epoch,
            operation,
            resulting_log: resulting_log.clone(),
            callback,
        };
        match self.sender.send(Event::Write(request)) {
            Ok(()) => guard.spearhead = resulting_log,
            Err(mpsc::error::SendError(event)) => {
                if let Event::Write(request) = event {
                    request.callback.send(Err(ReplicatedLogError::Cancelled));
                }
            }
        }

        future
    }
}

enum Event {
    Write(StorageRequest),
    Resign(Callback<LogCore>),
}

struct StorageRequest {
    epoch: u64,
    operation: Operation,
    resulting_log: InMemoryLog,
    callback: Callback<SequenceNumber>,
}

#[derive(Debug)]
pub(super) enum Operation {
    RemoveFront(LogIndex),
    RemoveBack(LogIndex),
    Append(InMemoryLog),
    UpdateMetadata(PersistedStateInfo),
}

/// StorageActor owns the persisted log while the manager is alive and works the queue.
struct StorageActor {
    receiver: mpsc::UnboundedReceiver<Event>,
    persisted: Box<dyn PersistedLog>,
    shared: Arc<Shared>,
    logger: slog::Logger,
}

impl StorageActor {
    async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            match event {
                Event::Write(request) => self.handle_request(request).await,
                Event::Resign(callback) => {
                    // Whatever got queued behind the resign is dropped, and resolves as Cancelled.
                    self.receiver.close();
                    slog::debug!(self.logger, "Storage queue drained, returning core");
                    callback.send(Ok(LogCore::from_boxed(self.persisted)));
                    return;
                }
            }
        }
    }

    // The next write must not start before this one settled.
    async fn handle_request(&mut self, request: StorageRequest) {
        if request.epoch != self.shared.current_epoch() {
            slog::warn!(self.logger, "Aborting {:?}, an earlier write failed", request.operation);
            request.callback.send(Err(ReplicatedLogError::Conflict));
            return;
        }

        let result = self.apply(&request.operation).await;

        let mut guard = self.shared.lock();
        match result {
            Ok(sequence_number) => {
                if let Operation::UpdateMetadata(info) = request.operation {
                    guard.info = info;
                }
                guard.on_disk = request.resulting_log;
                drop(guard);
                request.callback.send(Ok(sequence_number));
            }
            Err(e) => {
                slog::error!(self.logger, "Storage write {:?} failed: {}", request.operation, e);
                guard.epoch += 1;
                guard.spearhead = guard.on_disk.clone();
                drop(guard);
                request.callback.send(Err(ReplicatedLogError::StorageFailure(e)));
            }
        }
    }

    async fn apply(&mut self, operation: &Operation) -> Result<SequenceNumber, StorageError> {
        match operation {
            Operation::RemoveFront(stop) => self.persisted.remove_front(*stop, WriteOptions::default()).await,
            Operation::RemoveBack(start) => self.persisted.remove_back(*start, WriteOptions::default()).await,
            Operation::Append(log) => {
                if log.is_empty() {
                    return Ok(self.persisted.synced_sequence_number());
                }
                let options = WriteOptions {
                    wait_for_sync: log.requires_sync(),
                };
                let sequence_number = self.persisted.insert(log.persisted_entries(), options).await?;
                if options.wait_for_sync {
                    self.persisted.wait_for_sync(sequence_number).await?;
                }
                Ok(sequence_number)
            }
            Operation::UpdateMetadata(info) => {
                self.persisted.update_metadata(info.clone())?;
                Ok(self.persisted.synced_sequence_number())
            }
        }
    }
}
