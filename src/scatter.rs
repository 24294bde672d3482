//! Scatter/gather fan-out over nodes.
//!
//! [`run_on_all`] starts one worker task per item and waits for all of them.
//! Workers report through a [`Gather`] handle: any number of results, any
//! number of error strings, and an optional request to cancel their
//! siblings. A panicking worker becomes one error entry.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

/// Collection points handed to every worker.
pub struct Gather<T> {
    results: mpsc::UnboundedSender<T>,
    errors: mpsc::UnboundedSender<String>,
    cancel: Arc<watch::Sender<bool>>,
}

impl<T> Clone for Gather<T> {
    fn clone(&self) -> Self {
        Self {
            results: self.results.clone(),
            errors: self.errors.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Gather<T> {
    pub fn emit(&self, item: T) {
        let _ = self.results.send(item);
    }

    pub fn fail(&self, err: impl Into<String>) {
        let _ = self.errors.send(err.into());
    }

    /// Ask every sibling to stop at its next cancellation point.
    pub fn cancel_all(&self) {
        self.cancel.send_replace(true);
    }

    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Drive `fut` unless a sibling cancels first; `None` when cancelled.
    pub async fn unless_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        let mut signal = self.cancel.subscribe();
        if *signal.borrow_and_update() {
            return None;
        }
        tokio::select! {
            out = fut => Some(out),
            _ = signal.wait_for(|cancelled| *cancelled) => None,
        }
    }
}

/// Run `worker` once per item concurrently and collect everything emitted.
///
/// Returns only after every worker finished and both collections were
/// drained. Results arrive in completion order.
pub async fn run_on_all<N, T, F, Fut>(items: &[N], worker: F) -> (Vec<T>, Vec<String>)
where
    N: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(N, Gather<T>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    if items.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let (cancel, _) = watch::channel(false);
    let cancel = Arc::new(cancel);

    let handles: Vec<_> = items
        .iter()
        .map(|item| {
            let gather = Gather {
                results: results_tx.clone(),
                errors: errors_tx.clone(),
                cancel: cancel.clone(),
            };
            tokio::spawn(worker(item.clone(), gather))
        })
        .collect();

    for handle in handles {
        if let Err(err) = handle.await {
            let _ = errors_tx.send(describe_failure(err));
        }
    }
    drop(results_tx);
    drop(errors_tx);

    let mut results = Vec::new();
    while let Some(item) = results_rx.recv().await {
        results.push(item);
    }
    let mut errors = Vec::new();
    while let Some(err) = errors_rx.recv().await {
        errors.push(err);
    }
    (results, errors)
}

fn describe_failure(err: JoinError) -> String {
    if err.is_panic() {
        format!("Worker exception: {}", panic_message(err.into_panic()))
    } else {
        "Worker exception: task cancelled".to_string()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn collects_results_and_errors_from_every_worker() {
        let (mut results, mut errors) = run_on_all(&[1u64, 2, 3, 4], |n, gather: Gather<u64>| async move {
            if n % 2 == 0 {
                gather.emit(n * 10);
                gather.emit(n * 10 + 1);
            } else {
                gather.fail(format!("node {n}: odd"));
            }
        })
        .await;
        results.sort_unstable();
        errors.sort();
        assert_eq!(results, vec![20, 21, 40, 41]);
        assert_eq!(errors, vec!["node 1: odd", "node 3: odd"]);
    }

    #[tokio::test]
    async fn panics_become_error_entries() {
        let (results, errors) = run_on_all(&[1u64, 2], |n, gather: Gather<u64>| async move {
            if n == 2 {
                panic!("boom on {n}");
            }
            gather.emit(n);
        })
        .await;
        assert_eq!(results, vec![1]);
        assert_eq!(errors, vec!["Worker exception: boom on 2".to_string()]);
    }

    #[tokio::test]
    async fn first_success_cancels_siblings() {
        let (results, errors) = run_on_all(&[0u64, 1, 2], |n, gather: Gather<u64>| async move {
            if n == 0 {
                gather.emit(n);
                gather.cancel_all();
                return;
            }
            let slow = tokio::time::sleep(Duration::from_secs(30));
            match gather.unless_cancelled(slow).await {
                Some(()) => gather.emit(n),
                None => {}
            }
        })
        .await;
        assert_eq!(results, vec![0]);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn empty_input_returns_immediately() {
        let (results, errors) = run_on_all(&[] as &[u64], |_, gather: Gather<u64>| async move {
            gather.emit(1);
        })
        .await;
        assert!(results.is_empty());
        assert!(errors.is_empty());
    }
}
