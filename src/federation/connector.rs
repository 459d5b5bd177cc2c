// SPDX-License-Identifier: Apache-2.0

//! Per-source pull loop.
//!
//! Drives one `SourceExecution` through
//! `Initialized -> Executing -> (Retrying <-> Executing) -> Draining -> Closed`,
//! with `Failed` reachable from anywhere. A retry wait only parks the task
//! serving this source and wakes as soon as the request is cancelled.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{SourceExecution, SourcePoll};
use crate::engine::types::{ColumnInfo, Row};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initialized,
    Executing,
    Retrying,
    Draining,
    Closed,
    Failed,
}

/// Retry limits applied to one loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10_000,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Everything one instance produced.
#[derive(Debug, Clone, Default)]
pub struct InstanceOutput {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub update_counts: Vec<u64>,
    pub retries: u32,
    pub fetch_time_ms: f64,
}

pub struct ConnectorExecutionLoop {
    source_id: String,
    execution: Box<dyn SourceExecution>,
    cancel: CancellationToken,
    policy: RetryPolicy,
    state: LoopState,
    retries: u32,
    released: bool,
}

impl ConnectorExecutionLoop {
    pub fn new(
        source_id: impl Into<String>,
        execution: Box<dyn SourceExecution>,
        cancel: CancellationToken,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            execution,
            cancel,
            policy,
            state: LoopState::Initialized,
            retries: 0,
            released: false,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(source = %self.source_id, from = ?self.state, to = ?next, "Loop transition");
            self.state = next;
        }
    }

    /// Runs the loop to completion. Source resources are released exactly
    /// once, whatever the outcome.
    #[instrument(skip(self), fields(source = %self.source_id))]
    pub async fn run(&mut self, collect_update_counts: bool) -> EngineResult<InstanceOutput> {
        let started = Instant::now();
        match self.drive(collect_update_counts).await {
            Ok(mut output) => {
                self.release().await;
                self.transition(LoopState::Closed);
                output.retries = self.retries;
                output.fetch_time_ms = started.elapsed().as_secs_f64() * 1000.0;
                Ok(output)
            }
            Err(EngineError::Cancelled) => {
                if let Err(e) = self.execution.cancel().await {
                    warn!(source = %self.source_id, error = %e, "Source cancel failed");
                }
                self.release().await;
                self.transition(LoopState::Closed);
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                self.transition(LoopState::Failed);
                self.release().await;
                Err(err.attribute_to(&self.source_id))
            }
        }
    }

    async fn drive(&mut self, collect_update_counts: bool) -> EngineResult<InstanceOutput> {
        let cancel = self.cancel.clone();
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.transition(LoopState::Executing);
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.execution.execute() => Some(result),
        };
        executed.ok_or(EngineError::Cancelled)??;

        let mut rows = Vec::new();
        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                poll = self.execution.next() => Some(poll),
            };

            match polled.ok_or(EngineError::Cancelled)?? {
                SourcePoll::Row(row) => rows.push(row),
                SourcePoll::Retry { delay_ms } => self.wait_for_retry(delay_ms, &cancel).await?,
                SourcePoll::EndOfData => break,
            }
        }

        self.transition(LoopState::Draining);
        let update_counts = if collect_update_counts {
            self.execution.update_counts().await?
        } else {
            Vec::new()
        };

        Ok(InstanceOutput {
            columns: self.execution.columns(),
            rows,
            update_counts,
            retries: 0,
            fetch_time_ms: 0.0,
        })
    }

    async fn wait_for_retry(&mut self, delay_ms: u64, cancel: &CancellationToken) -> EngineResult<()> {
        self.retries += 1;
        if self.retries > self.policy.max_retries {
            return Err(EngineError::RetryExhausted {
                source_id: self.source_id.clone(),
                retries: self.policy.max_retries,
            });
        }
        metrics::record_retry();

        let delay = Duration::from_millis(delay_ms).min(self.policy.max_delay);
        self.transition(LoopState::Retrying);
        debug!(source = %self.source_id, delay_ms = delay.as_millis() as u64, attempt = self.retries, "Source not ready, waiting");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        self.transition(LoopState::Executing);
        Ok(())
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.execution.close().await {
            warn!(source = %self.source_id, error = %e, "Source close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        closed: AtomicUsize,
        cancelled: AtomicUsize,
    }

    struct Scripted {
        polls: VecDeque<EngineResult<SourcePoll>>,
        counts: Vec<u64>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl SourceExecution for Scripted {
        async fn execute(&mut self) -> EngineResult<()> {
            Ok(())
        }

        async fn next(&mut self) -> EngineResult<SourcePoll> {
            self.polls.pop_front().unwrap_or(Ok(SourcePoll::EndOfData))
        }

        async fn update_counts(&mut self) -> EngineResult<Vec<u64>> {
            Ok(self.counts.clone())
        }

        async fn close(&mut self) -> EngineResult<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel(&mut self) -> EngineResult<()> {
            self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scripted(polls: Vec<EngineResult<SourcePoll>>) -> (ConnectorExecutionLoop, Arc<Counters>, CancellationToken) {
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let execution = Scripted {
            polls: polls.into(),
            counts: vec![2],
            counters: counters.clone(),
        };
        let lp = ConnectorExecutionLoop::new("a", Box::new(execution), cancel.clone(), RetryPolicy::default());
        (lp, counters, cancel)
    }

    fn row(v: &str) -> EngineResult<SourcePoll> {
        Ok(SourcePoll::Row(Row::from([v])))
    }

    #[tokio::test]
    async fn drains_rows_then_closes_once() {
        let (mut lp, counters, _) = scripted(vec![row("x"), row("y")]);
        let output = lp.run(true).await.unwrap();

        assert_eq!(output.rows, vec![Row::from(["x"]), Row::from(["y"])]);
        assert_eq!(output.update_counts, vec![2]);
        assert_eq!(lp.state(), LoopState::Closed);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_the_requested_delay() {
        let (mut lp, _, _) = scripted(vec![Ok(SourcePoll::Retry { delay_ms: 50 }), row("x")]);
        let started = tokio::time::Instant::now();
        let output = lp.run(false).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(output.rows, vec![Row::from(["x"])]);
        assert_eq!(output.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let counters = Arc::new(Counters::default());
        let execution = Scripted {
            polls: (0..5).map(|_| Ok(SourcePoll::Retry { delay_ms: 1 })).collect(),
            counts: Vec::new(),
            counters: counters.clone(),
        };
        let policy = RetryPolicy {
            max_retries: 3,
            max_delay: Duration::from_millis(10),
        };
        let mut lp = ConnectorExecutionLoop::new("a", Box::new(execution), CancellationToken::new(), policy);

        let err = lp.run(false).await.unwrap_err();
        assert!(matches!(err, EngineError::RetryExhausted { retries: 3, .. }));
        assert_eq!(lp.state(), LoopState::Failed);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn source_error_fails_and_releases() {
        let (mut lp, counters, _) = scripted(vec![row("x"), Err(EngineError::execution_error("boom"))]);
        let err = lp.run(false).await.unwrap_err();

        assert!(matches!(err, EngineError::SourceFailed { ref source_id, .. } if source_id == "a"));
        assert_eq!(lp.state(), LoopState::Failed);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wakes_a_retrying_loop() {
        let (mut lp, counters, cancel) = scripted(vec![Ok(SourcePoll::Retry { delay_ms: 60_000 })]);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = lp.run(false).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(lp.state(), LoopState::Closed);
        assert_eq!(counters.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }
}
