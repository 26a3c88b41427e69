//! Bounded completion scheduler.
//!
//! Every stage of the pipeline fans out many short, independent async
//! operations (hashing, subprocess spawns, history queries). [`as_completed`]
//! runs them with a concurrency ceiling and returns all results in
//! *submission order*, regardless of internal completion races. On the first
//! failure it aborts everything still outstanding, waits for those aborts to
//! land, and propagates the original error; later failures observed while
//! draining are logged, never returned.
//!
//! Subprocess-backed operations must spawn their children with
//! `kill_on_drop` (see [`crate::process`]) so an abort here also terminates
//! the child rather than orphaning it.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default concurrency ceiling: available processing units × 3, keeping
/// I/O-bound work saturated without flooding the process table.
pub fn default_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 3
}

/// Caller-supplied execution policy. CI runs pick [`ExecPolicy::Sequential`]
/// for deterministic, diagnosable logs; everything else bounds fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecPolicy {
    Bounded(usize),
    Sequential,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self::Bounded(default_limit())
    }
}

impl ExecPolicy {
    /// Fail-fast execution under this policy; see [`as_completed`].
    pub async fn run<I, F, T>(self, ops: I) -> Result<Vec<T>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Self::Bounded(limit) => as_completed(ops, limit).await,
            Self::Sequential => in_order(ops).await,
        }
    }

    /// Settled execution under this policy; see [`as_settled`].
    pub async fn run_settled<I, F, T>(self, ops: I) -> Result<Vec<Result<T>>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Self::Bounded(limit) => as_settled(ops, limit).await,
            Self::Sequential => {
                let mut out = Vec::new();
                for op in ops {
                    out.push(op.await);
                }
                Ok(out)
            }
        }
    }
}

/// Run `ops` with at most `limit` in flight; results in submission order.
///
/// The first operation failure aborts and drains everything outstanding
/// before propagating. A task panic is reported the same way.
pub async fn as_completed<I, F, T>(ops: I, limit: usize) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut join = JoinSet::new();
    let mut slots: Vec<Option<T>> = Vec::new();
    let mut first_err: Option<anyhow::Error> = None;

    for (idx, op) in ops.into_iter().enumerate() {
        // Check completions opportunistically so a failure surfaces before
        // the whole sequence has been admitted.
        while let Some(res) = join.try_join_next() {
            if record(&mut slots, res, &mut first_err) {
                return Err(drain(&mut join, first_err).await);
            }
        }
        let permit = sem.clone().acquire_owned().await?;
        join.spawn(async move {
            let _permit = permit;
            (idx, op.await)
        });
    }

    while let Some(res) = join.join_next().await {
        if record(&mut slots, res, &mut first_err) {
            return Err(drain(&mut join, first_err).await);
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| slot.expect("every admitted operation reported a result"))
        .collect())
}

/// Like [`as_completed`], but individual operation failures are returned in
/// their slots instead of aborting the batch. Only a task panic tears the
/// batch down.
pub async fn as_settled<I, F, T>(ops: I, limit: usize) -> Result<Vec<Result<T>>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut join = JoinSet::new();
    let mut slots: Vec<Option<Result<T>>> = Vec::new();

    for (idx, op) in ops.into_iter().enumerate() {
        let permit = sem.clone().acquire_owned().await?;
        join.spawn(async move {
            let _permit = permit;
            (idx, op.await)
        });
    }

    while let Some(res) = join.join_next().await {
        match res {
            Ok((idx, out)) => place(&mut slots, idx, out),
            Err(join_err) => {
                return Err(drain(&mut join, Some(anyhow!(join_err).context("scheduler task failed"))).await)
            }
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| slot.expect("every admitted operation reported a result"))
        .collect())
}

/// Strictly sequential fallback: one at a time, fail fast, nothing ever
/// outstanding when an error propagates.
pub async fn in_order<I, F, T>(ops: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    let mut out = Vec::new();
    for op in ops {
        out.push(op.await?);
    }
    Ok(out)
}

fn place<T>(slots: &mut Vec<Option<T>>, idx: usize, value: T) {
    if slots.len() <= idx {
        slots.resize_with(idx + 1, || None);
    }
    slots[idx] = Some(value);
}

/// Record one completion; true means a failure was captured and the batch
/// should be torn down.
fn record<T>(
    slots: &mut Vec<Option<T>>,
    res: std::result::Result<(usize, Result<T>), tokio::task::JoinError>,
    first_err: &mut Option<anyhow::Error>,
) -> bool {
    match res {
        Ok((idx, Ok(value))) => {
            place(slots, idx, value);
            false
        }
        Ok((idx, Err(err))) => {
            *first_err = Some(err.context(format!("scheduled operation {idx} failed")));
            true
        }
        Err(join_err) => {
            *first_err = Some(anyhow!(join_err).context("scheduler task failed"));
            true
        }
    }
}

/// Abort everything outstanding and wait for the aborts to land. Failures
/// seen while draining are logged so they never mask the original error.
async fn drain<T: 'static>(
    join: &mut JoinSet<(usize, Result<T>)>,
    first_err: Option<anyhow::Error>,
) -> anyhow::Error {
    join.abort_all();
    while let Some(res) = join.join_next().await {
        if let Ok((idx, Err(err))) = res {
            tracing::warn!(operation = idx, error = %err, "secondary failure while draining");
        }
    }
    first_err.unwrap_or_else(|| anyhow!("scheduler drained without a recorded error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn results_come_back_in_submission_order() {
        // Later submissions finish first; the output order must not care.
        let ops = (0..8u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(40 - i * 5)).await;
            Ok(i)
        });
        let got = as_completed(ops, 4).await.unwrap();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_more_than_limit_in_flight() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let ops = (0..24).map(|_| {
            let live = live.clone();
            let peak = peak.clone();
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        as_completed(ops, 3).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn first_failure_propagates_after_draining() {
        let completed = Arc::new(AtomicUsize::new(0));
        let ops = (0..10).map(|i| {
            let completed = completed.clone();
            async move {
                if i == 2 {
                    anyhow::bail!("boom {i}");
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let err = as_completed(ops, 4).await.unwrap_err();
        assert!(err.to_string().contains("operation 2"), "{err:#}");
        let settled = completed.load(Ordering::SeqCst);
        // Nothing is still running once the error is returned.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(completed.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn settled_collects_every_outcome() {
        let ops = (0..6).map(|i| async move {
            if i % 2 == 0 {
                anyhow::bail!("even {i}");
            }
            Ok(i)
        });
        let got = as_settled(ops, 2).await.unwrap();
        assert_eq!(got.len(), 6);
        assert_eq!(got.iter().filter(|r| r.is_err()).count(), 3);
        assert_eq!(*got[1].as_ref().unwrap(), 1);
    }

    #[tokio::test]
    async fn sequential_policy_runs_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let ops = (0..4).map(|i| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(i);
                Ok(i)
            }
        });
        let got = ExecPolicy::Sequential.run(ops).await.unwrap();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn default_limit_is_at_least_three() {
        assert!(default_limit() >= 3);
    }
}
