//! Pipeline sources and sinks

use tracing::{debug, trace};

use super::cancel::CancelToken;
use super::pipeline::{emit, stage_channel, Stage};
use crate::error::{FerryError, MultiError, Result};

/// Feed the items of `iter` into a new stage, one at a time.
///
/// The iterator is advanced lazily, so only the item in flight is held in
/// memory. Stops early when `cancel` fires or the stage is dropped.
pub fn iter_generator<I>(cancel: &CancelToken, iter: I) -> Stage<I::Item>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    let (tx, rx) = stage_channel();
    let cancel = cancel.clone();
    let iter = iter.into_iter();
    tokio::spawn(async move {
        for item in iter {
            if !emit(&cancel, &tx, item).await {
                debug!("generator stopped early");
                return;
            }
        }
        trace!("generator exhausted");
    });
    rx
}

/// Feed each element of `items` into a new stage
pub fn slice_item_generator<T>(cancel: &CancelToken, items: Vec<T>) -> Stage<T>
where
    T: Send + 'static,
{
    iter_generator(cancel, items)
}

/// Feed items produced by a blocking iterator (e.g. a directory walk).
///
/// The iterator runs on the blocking thread pool.
pub fn blocking_generator<F, I>(cancel: &CancelToken, make_iter: F) -> Stage<I::Item>
where
    F: FnOnce() -> I + Send + 'static,
    I: IntoIterator,
    I::Item: Send + 'static,
{
    let (tx, rx) = stage_channel();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        for item in make_iter() {
            if cancel.is_cancelled() || tx.blocking_send(item).is_err() {
                debug!("blocking generator stopped early");
                return;
            }
        }
    });
    rx
}

/// Drain `input` into a vector.
///
/// Returns the cancellation cause instead when `cancel` fired, so a stage
/// that closed early is never mistaken for a complete result.
pub async fn slice_item_consumer<T>(cancel: &CancelToken, mut input: Stage<T>) -> Result<Vec<T>> {
    let mut items = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancel.error()),
            item = input.recv() => match item {
                Some(item) => items.push(item),
                None => break,
            },
        }
    }
    cancel.check()?;
    Ok(items)
}

/// Drain a stage of per-item errors into a [`MultiError`]
pub async fn error_consumer(cancel: &CancelToken, input: Stage<FerryError>) -> Result<()> {
    let errors = slice_item_consumer(cancel, input).await?;
    MultiError::from(errors).into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_iter_generator_preserves_order() {
        let cancel = CancelToken::new();
        let stage = iter_generator(&cancel, vec!["a", "b", "c"]);
        let items = slice_item_consumer(&cancel, stage).await.unwrap();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_consumer_surfaces_cancel_cause() {
        let cancel = CancelToken::new();
        let stage = iter_generator(&cancel, 0..);
        cancel.cancel(FerryError::Usage("stop".to_string()));
        let result = slice_item_consumer(&cancel, stage).await;
        assert!(matches!(result, Err(FerryError::Usage(msg)) if msg == "stop"));
    }

    #[tokio::test]
    async fn test_blocking_generator() {
        let cancel = CancelToken::new();
        let stage = blocking_generator(&cancel, || (0..5).map(|n| n * 10));
        let items = slice_item_consumer(&cancel, stage).await.unwrap();
        assert_eq!(items, vec![0, 10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn test_error_consumer_aggregates() {
        let cancel = CancelToken::new();

        let none = slice_item_generator(&cancel, Vec::<FerryError>::new());
        assert!(error_consumer(&cancel, none).await.is_ok());

        let some = slice_item_generator(
            &cancel,
            vec![
                FerryError::Io("a".to_string()),
                FerryError::Io("b".to_string()),
            ],
        );
        let result = error_consumer(&cancel, some).await;
        assert!(matches!(result, Err(FerryError::Multi(m)) if m.len() == 2));
    }
}
