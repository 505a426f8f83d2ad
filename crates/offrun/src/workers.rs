//! # Worker Lifecycle Table
//!
//! Tracks which workers the primary has created and whether each has
//! reported ready, along with the callbacks queued for that moment.
//!
//! ## Invariants
//! - **One State**: a worker id is absent, initializing, or ready, never
//!   two at once. Each record holds exactly one state.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use offrpc::WorkerId;

use crate::error::Error;
use crate::error::Result;

pub(crate) type ReadyCallback = Box<dyn FnOnce(WorkerId) -> anyhow::Result<()> + Send + Sync>;

/// Outcome of a request to create a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateStatus {
    /// Creation started.
    Initializing,
    /// The worker is already ready.
    AlreadyExists,
    /// Creation already started and has not finished.
    AlreadyInitializing,
}

/// Outcome of registering an additional ready callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyStatus {
    /// Queued until the worker reports ready.
    Registered,
    /// The worker was already ready; the callback ran immediately.
    Executed,
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Ready,
}

enum Record {
    Initializing(Vec<ReadyCallback>),
    Ready,
}

#[derive(Default)]
pub(crate) struct WorkerTable {
    records: DashMap<WorkerId, Record>,
}

impl WorkerTable {
    /// Starts tracking `worker` unless it is already known.
    pub(crate) fn begin(&self, worker: WorkerId, on_ready: Option<ReadyCallback>) -> CreateStatus {
        match self.records.entry(worker) {
            Entry::Occupied(entry) => match entry.get() {
                Record::Ready => CreateStatus::AlreadyExists,
                Record::Initializing(_) => CreateStatus::AlreadyInitializing,
            },
            Entry::Vacant(entry) => {
                entry.insert(Record::Initializing(on_ready.into_iter().collect()));
                CreateStatus::Initializing
            }
        }
    }

    /// Queues `callback` for an initializing worker. A ready worker hands the
    /// callback back to be run by the caller, outside the table's lock.
    pub(crate) fn add_ready_callback(
        &self,
        worker: WorkerId,
        callback: ReadyCallback,
    ) -> (ReadyStatus, Option<ReadyCallback>) {
        match self.records.get_mut(&worker) {
            Some(mut record) => match &mut *record {
                Record::Initializing(callbacks) => {
                    callbacks.push(callback);
                    (ReadyStatus::Registered, None)
                }
                Record::Ready => (ReadyStatus::Executed, Some(callback)),
            },
            None => (ReadyStatus::NotFound, None),
        }
    }

    /// Marks `worker` ready and returns its queued callbacks.
    ///
    /// A ready signal for a worker that is not initializing means the two
    /// sides disagree about which workers exist.
    pub(crate) fn promote(&self, worker: WorkerId) -> Result<Vec<ReadyCallback>> {
        let mut record = self
            .records
            .get_mut(&worker)
            .ok_or(Error::NoCallbacksRegistered(worker))?;
        match std::mem::replace(&mut *record, Record::Ready) {
            Record::Initializing(callbacks) => Ok(callbacks),
            Record::Ready => Err(Error::NoCallbacksRegistered(worker)),
        }
    }

    /// Forgets `worker`. Queued callbacks are dropped unrun.
    pub(crate) fn remove(&self, worker: WorkerId) -> bool {
        self.records.remove(&worker).is_some()
    }

    pub(crate) fn state(&self, worker: WorkerId) -> Option<WorkerState> {
        self.records.get(&worker).map(|record| match *record {
            Record::Initializing(_) => WorkerState::Initializing,
            Record::Ready => WorkerState::Ready,
        })
    }

    pub(crate) fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> ReadyCallback {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn lifecycle() {
        let table = WorkerTable::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let worker = WorkerId(1);

        assert_eq!(table.begin(worker, Some(counting(&fired))), CreateStatus::Initializing);
        assert_eq!(table.begin(worker, None), CreateStatus::AlreadyInitializing);
        assert_eq!(table.state(worker), Some(WorkerState::Initializing));

        let (status, handed_back) = table.add_ready_callback(worker, counting(&fired));
        assert_eq!(status, ReadyStatus::Registered);
        assert!(handed_back.is_none());

        for callback in table.promote(worker).unwrap() {
            callback(worker).unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(table.state(worker), Some(WorkerState::Ready));
        assert_eq!(table.begin(worker, None), CreateStatus::AlreadyExists);

        let (status, handed_back) = table.add_ready_callback(worker, counting(&fired));
        assert_eq!(status, ReadyStatus::Executed);
        assert!(handed_back.is_some());

        assert!(table.remove(worker));
        assert_eq!(table.state(worker), None);
    }

    #[test]
    fn unknown_workers() {
        let table = WorkerTable::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let (status, _) = table.add_ready_callback(WorkerId(7), counting(&fired));
        assert_eq!(status, ReadyStatus::NotFound);
        assert!(matches!(table.promote(WorkerId(7)), Err(Error::NoCallbacksRegistered(_))));
    }

    #[test]
    fn a_second_ready_signal_is_a_desync() {
        let table = WorkerTable::default();
        table.begin(WorkerId(3), None);
        assert!(table.promote(WorkerId(3)).unwrap().is_empty());
        assert!(table.promote(WorkerId(3)).is_err());
        assert_eq!(table.ids(), [WorkerId(3)]);
    }
}
