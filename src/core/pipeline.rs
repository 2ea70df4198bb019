//! Channel-based pipeline stages
//!
//! Every stage reads from a [`Stage`] (the receiving half of a bounded tokio
//! channel) and returns a new one. Channels hold a single item, so a slow
//! consumer applies backpressure all the way up to the generator.
//!
//! # Processor contract
//!
//! A processor is an async closure `(CancelToken, I) -> ProcessStatus<O>`:
//!
//! - [`ProcessStatus::Output`] forwards a value downstream
//! - [`ProcessStatus::Skip`] drops the input and keeps going
//! - [`ProcessStatus::Abort`] stops the current worker only
//!
//! Aborting does not cancel sibling workers. A processor that wants the whole
//! stage to stop must cancel the token it was handed, typically with the error
//! that made it give up.
//!
//! # Examples
//!
//! ```no_run
//! use ferry::core::cancel::CancelToken;
//! use ferry::core::generator::{iter_generator, slice_item_consumer};
//! use ferry::core::pipeline::{parallel_process, ProcessStatus};
//!
//! # async fn demo() -> ferry::Result<()> {
//! let cancel = CancelToken::new();
//! let numbers = iter_generator(&cancel, 1..=100u64);
//! let squares = parallel_process(
//!     &cancel,
//!     4,
//!     numbers,
//!     |_cancel, n: u64| async move { ProcessStatus::Output(n * n) },
//!     None,
//! );
//! let results = slice_item_consumer(&cancel, squares).await?;
//! assert_eq!(results.len(), 100);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::cancel::CancelToken;

/// Receiving end of a pipeline stage
pub type Stage<T> = mpsc::Receiver<T>;

/// Runs once after a stage's input loop exits, before its output closes.
///
/// The flag is `true` only when every worker drained its input normally.
pub type Finalizer<O> = Box<dyn FnOnce(&CancelToken, bool) -> ProcessStatus<O> + Send>;

/// Outcome of processing one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus<O> {
    Output(O),
    Skip,
    Abort,
}

/// Create a stage channel with the pipeline's hand-off capacity
pub fn stage_channel<T>() -> (mpsc::Sender<T>, Stage<T>) {
    mpsc::channel(1)
}

/// Send `item` downstream unless `cancel` fires first.
///
/// Returns `false` when the item was not delivered, either because the token
/// was cancelled or the receiver went away.
pub async fn emit<T>(cancel: &CancelToken, output: &mpsc::Sender<T>, item: T) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = output.send(item) => sent.is_ok(),
    }
}

/// Input shared by all workers of a stage; each item reaches exactly one worker
struct SharedInput<I>(Arc<Mutex<Stage<I>>>);

impl<I> Clone for SharedInput<I> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<I> SharedInput<I> {
    fn new(input: Stage<I>) -> Self {
        Self(Arc::new(Mutex::new(input)))
    }

    async fn recv(&self) -> Option<I> {
        self.0.lock().await.recv().await
    }
}

/// Per-worker loop. Returns `true` when the input was drained normally.
async fn process_channel<I, O, F, Fut>(
    cancel: &CancelToken,
    input: &SharedInput<I>,
    output: &mpsc::Sender<O>,
    processor: &F,
) -> bool
where
    F: Fn(CancelToken, I) -> Fut,
    Fut: Future<Output = ProcessStatus<O>>,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("cancelled while waiting for input");
                return false;
            }
            item = input.recv() => item,
        };

        let Some(item) = item else {
            trace!("input channel closed");
            return true;
        };

        if cancel.is_cancelled() {
            debug!("cancelled before processing item");
            return false;
        }

        match processor(cancel.clone(), item).await {
            ProcessStatus::Output(value) => {
                if !emit(cancel, output, value).await {
                    debug!("output not delivered, stopping");
                    return false;
                }
            }
            ProcessStatus::Skip => trace!("item skipped"),
            ProcessStatus::Abort => {
                debug!("processor aborted");
                return false;
            }
        }
    }
}

async fn finalize<O>(
    cancel: &CancelToken,
    output: &mpsc::Sender<O>,
    finalizer: Option<Finalizer<O>>,
    finished_input: bool,
) {
    let Some(finalizer) = finalizer else {
        return;
    };
    if let ProcessStatus::Output(value) = finalizer(cancel, finished_input) {
        if !emit(cancel, output, value).await {
            debug!("final value not delivered");
        }
    }
}

/// Single-worker stage.
///
/// Reads `input` until it closes or `cancel` fires, running `processor` on
/// each item. The finalizer runs once after the loop, then the output closes.
pub fn process<I, O, F, Fut>(
    cancel: &CancelToken,
    input: Stage<I>,
    processor: F,
    finalizer: Option<Finalizer<O>>,
) -> Stage<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(CancelToken, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessStatus<O>> + Send + 'static,
{
    let (tx, rx) = stage_channel();
    let cancel = cancel.clone();
    let input = SharedInput::new(input);

    tokio::spawn(
        async move {
            let finished = process_channel(&cancel, &input, &tx, &processor).await;
            finalize(&cancel, &tx, finalizer, finished).await;
            debug!(finished, "closing output channel");
        }
        .instrument(debug_span!("process")),
    );

    rx
}

/// Fan-out/fan-in stage with `workers` concurrent processors.
///
/// Workers share `input` and `output`. The finalizer sees `true` only if every
/// worker drained its share; a single abort or cancellation makes it `false`.
/// The output closes after all workers have returned and the finalizer ran.
pub fn parallel_process<I, O, F, Fut>(
    cancel: &CancelToken,
    workers: usize,
    input: Stage<I>,
    processor: F,
    finalizer: Option<Finalizer<O>>,
) -> Stage<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(CancelToken, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessStatus<O>> + Send + 'static,
{
    let workers = workers.max(1);
    let (tx, rx) = stage_channel();
    let input = SharedInput::new(input);
    let processor = Arc::new(processor);

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let cancel = cancel.clone();
        let input = input.clone();
        let tx = tx.clone();
        let processor = Arc::clone(&processor);
        handles.push(tokio::spawn(
            async move {
                let finished = process_channel(&cancel, &input, &tx, processor.as_ref()).await;
                trace!(finished, "worker exiting");
                finished
            }
            .instrument(debug_span!("worker", worker)),
        ));
    }

    let cancel = cancel.clone();
    tokio::spawn(
        async move {
            let mut finished = true;
            for handle in handles {
                match handle.await {
                    Ok(worker_finished) => finished &= worker_finished,
                    Err(err) => {
                        warn!(error = %err, "worker task failed");
                        finished = false;
                    }
                }
            }
            finalize(&cancel, &tx, finalizer, finished).await;
            debug!(finished, workers, "closing output channel");
        }
        .instrument(debug_span!("parallel_process")),
    );

    rx
}

/// Group items into vectors of `size`.
///
/// Full batches are emitted as soon as they fill; a trailing partial batch is
/// emitted only when the input was drained normally. Never emits an empty batch.
pub fn batch<T>(cancel: &CancelToken, input: Stage<T>, size: usize) -> Stage<Vec<T>>
where
    T: Send + 'static,
{
    let size = size.max(1);
    let pending: Arc<StdMutex<Vec<T>>> = Arc::new(StdMutex::new(Vec::with_capacity(size)));

    let tail = Arc::clone(&pending);
    let finalizer: Finalizer<Vec<T>> = Box::new(move |_cancel, finished_input| {
        let rest = match tail.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if finished_input && !rest.is_empty() {
            ProcessStatus::Output(rest)
        } else {
            ProcessStatus::Skip
        }
    });

    process(
        cancel,
        input,
        move |_cancel, item: T| {
            let pending = Arc::clone(&pending);
            async move {
                let mut guard = match pending.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.push(item);
                if guard.len() < size {
                    ProcessStatus::Skip
                } else {
                    ProcessStatus::Output(std::mem::replace(&mut *guard, Vec::with_capacity(size)))
                }
            }
        },
        Some(finalizer),
    )
}

/// Drop `None` items, unwrapping the rest
pub fn filter_some<T>(cancel: &CancelToken, input: Stage<Option<T>>) -> Stage<T>
where
    T: Send + 'static,
{
    process(
        cancel,
        input,
        |_cancel, item: Option<T>| async move {
            match item {
                Some(value) => ProcessStatus::Output(value),
                None => ProcessStatus::Skip,
            }
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generator::{iter_generator, slice_item_consumer};
    use crate::error::FerryError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn drain<T>(mut stage: Stage<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = stage.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_process_forwards_and_skips() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, 1..=10u32);
        let evens = process(
            &cancel,
            input,
            |_c, n: u32| async move {
                if n % 2 == 0 {
                    ProcessStatus::Output(n)
                } else {
                    ProcessStatus::Skip
                }
            },
            None,
        );
        assert_eq!(drain(evens).await, vec![2, 4, 6, 8, 10]);
    }

    #[tokio::test]
    async fn test_abort_stops_and_finalizer_sees_unfinished() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, 1..=10u32);
        let finalizer: Finalizer<u32> = Box::new(|_c, finished| {
            ProcessStatus::Output(if finished { 100 } else { 0 })
        });
        let out = process(
            &cancel,
            input,
            |_c, n: u32| async move {
                if n == 3 {
                    ProcessStatus::Abort
                } else {
                    ProcessStatus::Output(n)
                }
            },
            Some(finalizer),
        );
        assert_eq!(drain(out).await, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_finalizer_sees_finished_input() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, 0..3u32);
        let finalizer: Finalizer<u32> =
            Box::new(|_c, finished| ProcessStatus::Output(if finished { 99 } else { 0 }));
        let out = process(
            &cancel,
            input,
            |_c, n: u32| async move { ProcessStatus::Output(n) },
            Some(finalizer),
        );
        assert_eq!(drain(out).await, vec![0, 1, 2, 99]);
    }

    #[tokio::test]
    async fn test_parallel_process_delivers_every_item_once() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, 0..200u64);
        let out = parallel_process(
            &cancel,
            8,
            input,
            |_c, n: u64| async move {
                tokio::task::yield_now().await;
                ProcessStatus::Output(n)
            },
            None,
        );
        let mut seen = drain(out).await;
        seen.sort_unstable();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_parallel_abort_marks_unfinished_without_cancelling_siblings() {
        let cancel = CancelToken::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let input = iter_generator(&cancel, 0..50u32);
        let finalizer: Finalizer<u32> =
            Box::new(|_c, finished| ProcessStatus::Output(if finished { 1 } else { 0 }));
        let out = parallel_process(
            &cancel,
            4,
            input,
            move |_c, n: u32| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        ProcessStatus::Abort
                    } else {
                        ProcessStatus::Skip
                    }
                }
            },
            Some(finalizer),
        );
        assert_eq!(drain(out).await, vec![0]);
        assert!(!cancel.is_cancelled());
        // The three remaining workers consume everything the aborted one left.
        assert_eq!(processed.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_cancel_from_processor_stops_all_workers() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, 0..10_000u32);
        let out = parallel_process(
            &cancel,
            4,
            input,
            |cancel: CancelToken, n: u32| async move {
                if n == 10 {
                    cancel.cancel(FerryError::Io("chunk 10 failed".to_string()));
                    return ProcessStatus::Abort;
                }
                ProcessStatus::Output(n)
            },
            None,
        );
        let result = slice_item_consumer(&cancel, out).await;
        assert!(matches!(result, Err(FerryError::Io(msg)) if msg == "chunk 10 failed"));
    }

    #[tokio::test]
    async fn test_batch_emits_full_then_partial() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, 0..11u32);
        let sizes: Vec<usize> = drain(batch(&cancel, input, 3))
            .await
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![3, 3, 3, 2]);
    }

    #[tokio::test]
    async fn test_batch_exact_multiple_has_no_empty_tail() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, 0..9u32);
        let batches = drain(batch(&cancel, input, 3)).await;
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 3));
    }

    #[tokio::test]
    async fn test_batch_empty_input_emits_nothing() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, std::iter::empty::<u32>());
        assert!(drain(batch(&cancel, input, 5)).await.is_empty());
    }

    #[tokio::test]
    async fn test_filter_some() {
        let cancel = CancelToken::new();
        let input = iter_generator(&cancel, vec![Some(1), None, Some(3), None]);
        assert_eq!(drain(filter_some(&cancel, input)).await, vec![1, 3]);
    }
}
