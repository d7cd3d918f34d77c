// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The shard worker loop.
//!
//! A shard registers itself with [`StorageAdapter::start_shard`], then keeps up to
//! `workers` claimed items executing at once until the store has no `Ready` item left. The
//! store is the only thing shards share, so any number of them can run against one run.
//!
//! The main structure in this module is [`ShardRunner`].

use crate::{
    engine::{ExecuteRequest, ExecutionOutcome, TestEngine},
    errors::{ShardError, StorageError},
    storage::StorageAdapter,
};
use camino::Utf8PathBuf;
use futures::stream::{FuturesUnordered, StreamExt};
use orchestrator_metadata::{RunConfig, RunUuid, TestItem};
use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// The default output directory for engine artifacts.
pub const DEFAULT_OUTPUT_DIR: &str = "test-output";

/// Test runner options.
#[derive(Debug)]
pub struct ShardRunnerBuilder {
    output_dir: Utf8PathBuf,
    runtime_threads: Option<usize>,
}

impl Default for ShardRunnerBuilder {
    fn default() -> Self {
        Self {
            output_dir: DEFAULT_OUTPUT_DIR.into(),
            runtime_threads: None,
        }
    }
}

impl ShardRunnerBuilder {
    /// Sets the directory the engine writes its per-test artifacts to.
    ///
    /// The directory is deleted when the shard starts.
    pub fn set_output_dir(&mut self, output_dir: impl Into<Utf8PathBuf>) -> &mut Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Sets the number of runtime worker threads. Defaults to the number of CPUs.
    pub fn set_runtime_threads(&mut self, threads: usize) -> &mut Self {
        self.runtime_threads = Some(threads.max(1));
        self
    }

    /// Creates a new shard runner for `run_id`.
    pub fn build(
        &self,
        run_id: RunUuid,
        storage: Arc<dyn StorageAdapter>,
        engine: Arc<dyn TestEngine>,
    ) -> Result<ShardRunner, ShardError> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("orchestrator-shard");
        if let Some(threads) = self.runtime_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder.build().map_err(ShardError::RuntimeCreate)?;

        Ok(ShardRunner {
            run_id,
            storage,
            engine,
            output_dir: self.output_dir.clone(),
            runtime,
        })
    }
}

/// Context for running one shard of a test run.
#[derive(Debug)]
pub struct ShardRunner {
    run_id: RunUuid,
    storage: Arc<dyn StorageAdapter>,
    engine: Arc<dyn TestEngine>,
    output_dir: Utf8PathBuf,
    runtime: Runtime,
}

impl ShardRunner {
    /// Executes the shard until the queue is exhausted.
    ///
    /// Test failures are recorded in the store and counted in the returned [`RunStats`]. An
    /// error aborts the shard: executions still in flight are killed, and the items they
    /// claimed stay `Ongoing`.
    pub fn execute<F>(self, mut callback: F) -> Result<RunStats, ShardError>
    where
        F: FnMut(ShardEvent<'_>),
    {
        self.remove_output_dir()?;
        self.runtime.block_on(self.run_shard(&mut callback))
    }

    fn remove_output_dir(&self) -> Result<(), ShardError> {
        match std::fs::remove_dir_all(&self.output_dir) {
            Ok(()) => {
                debug!(output_dir = %self.output_dir, "removed previous output directory");
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ShardError::OutputDirRemove {
                path: self.output_dir.clone(),
                error,
            }),
        }
    }

    async fn run_shard(
        &self,
        callback: &mut dyn FnMut(ShardEvent<'_>),
    ) -> Result<RunStats, ShardError> {
        let start = Instant::now();
        let run_id = self.run_id;

        let config = blocking(&self.storage, move |storage| storage.start_shard(run_id)).await?;
        let config = Arc::new(config);
        let limit = config.worker_limit();
        info!(%run_id, status = %config.status, workers = limit, "shard started");
        callback(ShardEvent::ShardStarted {
            run_id,
            config: &config,
        });

        let mut stats = RunStats::default();
        let mut in_flight = FuturesUnordered::new();
        let mut exhausted = false;

        loop {
            while !exhausted && in_flight.len() < limit {
                let claim_config = config.clone();
                let next = blocking(&self.storage, move |storage| {
                    storage.get_next_test(run_id, &claim_config)
                })
                .await?;
                match next {
                    Some(item) => {
                        debug!(%run_id, order = item.order, test = %item.display_key(), "claimed test");
                        stats.claimed += 1;
                        callback(ShardEvent::TestStarted {
                            item: &item,
                            running: in_flight.len() + 1,
                        });
                        in_flight.push(self.run_item(item, config.clone()));
                    }
                    None => {
                        debug!(%run_id, "no ready tests left");
                        exhausted = true;
                    }
                }
            }

            let Some(finished) = in_flight.next().await else {
                break;
            };
            let FinishedItem {
                item,
                outcome,
                elapsed,
            } = finished?;
            if outcome.passed {
                stats.passed += 1;
            } else {
                stats.failed += 1;
            }
            callback(ShardEvent::TestFinished {
                item: &item,
                outcome: &outcome,
                elapsed,
                running: in_flight.len(),
            });
        }

        blocking(&self.storage, move |storage| storage.finish_shard(run_id)).await?;
        let elapsed = start.elapsed();
        info!(
            %run_id,
            passed = stats.passed,
            failed = stats.failed,
            elapsed = ?elapsed,
            "shard finished"
        );
        callback(ShardEvent::ShardFinished {
            stats: &stats,
            elapsed,
        });
        Ok(stats)
    }

    async fn run_item(
        &self,
        item: TestItem,
        config: Arc<RunConfig>,
    ) -> Result<FinishedItem, ShardError> {
        let start = Instant::now();
        let outcome = self
            .engine
            .execute(ExecuteRequest {
                item: &item,
                config: &config,
                output_dir: &self.output_dir,
            })
            .await?;
        let elapsed = start.elapsed();

        let run_id = self.run_id;
        let passed = outcome.passed;
        let record_item = item.clone();
        let result = outcome.result.clone();
        blocking(&self.storage, move |storage| {
            if passed {
                storage.finish_test(run_id, &config, &record_item, &result)
            } else {
                storage.fail_test(run_id, &config, &record_item, &result)
            }
        })
        .await?;

        Ok(FinishedItem {
            item,
            outcome,
            elapsed,
        })
    }
}

struct FinishedItem {
    item: TestItem,
    outcome: ExecutionOutcome,
    elapsed: Duration,
}

/// Runs a storage operation on the blocking thread pool.
async fn blocking<T, F>(storage: &Arc<dyn StorageAdapter>, f: F) -> Result<T, ShardError>
where
    T: Send + 'static,
    F: FnOnce(&dyn StorageAdapter) -> Result<T, StorageError> + Send + 'static,
{
    let storage = storage.clone();
    let value = tokio::task::spawn_blocking(move || f(&*storage)).await??;
    Ok(value)
}

/// An event emitted while a shard executes.
#[derive(Clone, Copy, Debug)]
pub enum ShardEvent<'a> {
    /// The shard registered with the store.
    ShardStarted {
        /// The run being executed.
        run_id: RunUuid,
        /// The run configuration returned by the store.
        config: &'a RunConfig,
    },

    /// A test was claimed and is about to run.
    TestStarted {
        /// The claimed item.
        item: &'a TestItem,
        /// The number of executions in flight, including this one.
        running: usize,
    },

    /// A test finished and its result was recorded.
    TestFinished {
        /// The item.
        item: &'a TestItem,
        /// The engine's verdict and result.
        outcome: &'a ExecutionOutcome,
        /// Wall-clock time spent in the engine.
        elapsed: Duration,
        /// The number of executions still in flight.
        running: usize,
    },

    /// The queue is exhausted and the shard has marked the run finished.
    ShardFinished {
        /// Statistics for this shard.
        stats: &'a RunStats,
        /// Total time taken by the shard.
        elapsed: Duration,
    },
}

/// Statistics for a single shard.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The number of items this shard claimed.
    pub claimed: usize,

    /// The number of items that passed.
    pub passed: usize,

    /// The number of items that failed.
    pub failed: usize,
}

impl RunStats {
    /// Returns the number of items whose result was recorded.
    pub fn finished_count(&self) -> usize {
        self.passed + self.failed
    }
}
