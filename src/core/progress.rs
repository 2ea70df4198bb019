/*!
 * Progress aggregation for concurrent transfers
 *
 * Workers never touch progress state directly. They send deltas through a
 * [`ProgressHandle`]; a single aggregator task owns the running `done` and
 * `total` counters and forwards each new snapshot to the caller's
 * [`ReportProgress`] callback. Sending never blocks and never fails the
 * transfer, so progress stays decoupled from the success path.
 */

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::FerryError;

/// What a transfer's counters measure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Bytes,
    Objects,
}

/// Lifecycle of a reported transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressState {
    Running,
    Done,
    Failed(String),
}

/// Snapshot delivered to a [`ReportProgress`] callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub name: String,
    pub done: u64,
    pub total: u64,
    pub units: Units,
    pub state: ProgressState,
}

impl ProgressUpdate {
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, ProgressState::Running)
    }
}

/// Receives progress snapshots; called from the aggregator task only
pub trait ReportProgress: Send + Sync {
    fn report(&self, update: &ProgressUpdate);
}

impl<F> ReportProgress for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: &ProgressUpdate) {
        self(update)
    }
}

/// One delta from a worker
#[derive(Debug, Clone, Default)]
pub struct ProgressEvent {
    pub delta_done: u64,
    pub delta_total: u64,
    pub error: Option<FerryError>,
}

enum Message {
    Event(ProgressEvent),
    /// Emit the final state and stop, even while handles are still alive
    Finish(Option<FerryError>),
}

/// Cheap, cloneable sender used by workers
#[derive(Clone, Default)]
pub struct ProgressHandle {
    sender: Option<UnboundedSender<Message>>,
}

impl ProgressHandle {
    /// A handle that discards everything
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn send(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Message::Event(event));
        }
    }

    /// Record `n` more units done
    pub fn advance(&self, n: u64) {
        if n > 0 {
            self.send(ProgressEvent {
                delta_done: n,
                ..Default::default()
            });
        }
    }

    /// Record `n` more units expected
    pub fn grow(&self, n: u64) {
        if n > 0 {
            self.send(ProgressEvent {
                delta_total: n,
                ..Default::default()
            });
        }
    }

    /// Record a failure; the first one is reported at the end
    pub fn fail(&self, error: FerryError) {
        self.send(ProgressEvent {
            error: Some(error),
            ..Default::default()
        });
    }
}

impl fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("enabled", &self.sender.is_some())
            .finish()
    }
}

/// Owner of one transfer's progress state
pub struct ProgressAggregator {
    handle: ProgressHandle,
    task: Option<JoinHandle<()>>,
}

impl ProgressAggregator {
    /// Start aggregating. With no reporter, every operation is a no-op.
    pub fn start(
        reporter: Option<Arc<dyn ReportProgress>>,
        name: impl Into<String>,
        total: u64,
        units: Units,
    ) -> Self {
        let Some(reporter) = reporter else {
            return Self {
                handle: ProgressHandle::disabled(),
                task: None,
            };
        };

        let (sender, receiver) = unbounded_channel();
        let name = name.into();
        let task = tokio::spawn(aggregate(reporter, receiver, name, total, units));

        Self {
            handle: ProgressHandle {
                sender: Some(sender),
            },
            task: Some(task),
        }
    }

    /// Aggregator counting bytes
    pub fn bytes(
        reporter: Option<Arc<dyn ReportProgress>>,
        name: impl Into<String>,
        total: u64,
    ) -> Self {
        Self::start(reporter, name, total, Units::Bytes)
    }

    /// Aggregator counting objects
    pub fn objects(
        reporter: Option<Arc<dyn ReportProgress>>,
        name: impl Into<String>,
        total: u64,
    ) -> Self {
        Self::start(reporter, name, total, Units::Objects)
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    /// Emit the final report and wait for it.
    ///
    /// `outcome` decides between a Done and a Failed final state; a failure
    /// reported earlier through a handle also yields Failed. Handles that
    /// outlive this call keep working but their events are discarded.
    pub async fn finish<T>(mut self, outcome: &Result<T, FerryError>) {
        if let Some(sender) = self.handle.sender.take() {
            let error = outcome.as_ref().err().cloned();
            let _ = sender.send(Message::Finish(error));
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn aggregate(
    reporter: Arc<dyn ReportProgress>,
    mut receiver: UnboundedReceiver<Message>,
    name: String,
    total: u64,
    units: Units,
) {
    let mut update = ProgressUpdate {
        name,
        done: 0,
        total,
        units,
        state: ProgressState::Running,
    };
    let mut first_error: Option<FerryError> = None;
    reporter.report(&update);

    while let Some(message) = receiver.recv().await {
        let event = match message {
            Message::Event(event) => event,
            Message::Finish(error) => {
                if let Some(err) = error {
                    first_error.get_or_insert(err);
                }
                break;
            }
        };
        if let Some(err) = event.error {
            first_error.get_or_insert(err);
        }
        if event.delta_done == 0 && event.delta_total == 0 {
            continue;
        }
        update.done = update.done.saturating_add(event.delta_done);
        update.total = update.total.saturating_add(event.delta_total);
        trace!(name = %update.name, done = update.done, total = update.total, "progress");
        reporter.report(&update);
    }

    update.state = match first_error {
        Some(err) => ProgressState::Failed(err.to_string()),
        None => ProgressState::Done,
    };
    reporter.report(&update);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<dyn ReportProgress>, Arc<Mutex<Vec<ProgressUpdate>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reporter: Arc<dyn ReportProgress> = Arc::new(move |u: &ProgressUpdate| {
            sink.lock().unwrap().push(u.clone());
        });
        (reporter, seen)
    }

    #[tokio::test]
    async fn test_deltas_accumulate_and_end_done() {
        let (reporter, seen) = recorder();
        let progress = ProgressAggregator::bytes(Some(reporter), "file", 30);
        let handle = progress.handle();
        handle.advance(10);
        handle.advance(20);
        progress.finish(&Ok::<(), FerryError>(())).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().map(|u| u.done), Some(0));
        let last = seen.last().unwrap();
        assert_eq!(last.done, 30);
        assert_eq!(last.total, 30);
        assert_eq!(last.state, ProgressState::Done);
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let (reporter, seen) = recorder();
        let progress = ProgressAggregator::objects(Some(reporter), "delete", 0);
        progress.handle().grow(5);
        progress.handle().advance(2);
        progress
            .finish(&Err::<(), _>(FerryError::Io("boom".to_string())))
            .await;

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.units, Units::Objects);
        assert_eq!(last.total, 5);
        assert!(matches!(&last.state, ProgressState::Failed(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_finish_while_handles_are_alive() {
        let (reporter, seen) = recorder();
        let progress = ProgressAggregator::objects(Some(reporter), "list", 0);
        let handle = progress.handle();
        let background = progress.handle();
        handle.grow(3);
        handle.advance(3);

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            progress.finish(&Ok::<(), FerryError>(())),
        )
        .await
        .expect("finish must not wait for outstanding handles");

        // Late events are dropped without panicking
        background.advance(1);
        handle.fail(FerryError::Cancelled);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().filter(|u| u.is_finished()).count(), 1);
        let last = seen.last().unwrap();
        assert_eq!((last.done, last.total), (3, 3));
        assert_eq!(last.state, ProgressState::Done);
    }

    #[tokio::test]
    async fn test_disabled_aggregator_is_noop() {
        let progress = ProgressAggregator::bytes(None, "quiet", 10);
        progress.handle().advance(10);
        progress.finish(&Ok::<(), FerryError>(())).await;
    }
}
