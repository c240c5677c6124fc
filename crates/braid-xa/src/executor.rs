//! Shared blocking executor.
//!
//! Participant calls block. Work that has to run concurrently (parallel
//! prepare) or under a deadline (remote commands) is handed to the blocking
//! pool of one process-wide tokio runtime, and the caller waits on it with
//! `block_on`. The pool is bounded, so a transport that never answers holds
//! at most one pool thread instead of leaking a fresh OS thread per command.
//!
//! The entry points block the calling thread and must not be used from
//! inside an async task; call the directory through `spawn_blocking` there.

use std::sync::OnceLock;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

use braid_common::prelude::*;

const WORKER_THREADS: usize = 2;
const MAX_BLOCKING_THREADS: usize = 256;

static EXECUTOR: OnceLock<std::result::Result<Executor, String>> = OnceLock::new();

pub struct Executor {
    runtime: Runtime,
}

impl Executor {
    /// The process-wide executor, built on first use.
    pub fn global() -> Result<&'static Executor> {
        EXECUTOR
            .get_or_init(|| Self::build().map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| Error::Internal(format!("failed to start executor: {e}")))
    }

    fn build() -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .max_blocking_threads(MAX_BLOCKING_THREADS)
            .thread_name("braid-exec")
            .enable_time()
            .build()?;
        debug!(
            "Executor started ({} workers, {} blocking threads max)",
            WORKER_THREADS, MAX_BLOCKING_THREADS
        );
        Ok(Self { runtime })
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Run `task` on the blocking pool and wait at most `timeout` for it.
    ///
    /// Returns `None` when the deadline passes first. The task is not
    /// cancelled; its result is dropped when it eventually finishes.
    pub fn run_with_timeout<T, F>(&self, timeout: Duration, task: F) -> Option<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.runtime.block_on(async move {
            match tokio::time::timeout(timeout, tokio::task::spawn_blocking(task)).await {
                Ok(Ok(value)) => Some(Ok(value)),
                Ok(Err(e)) => Some(Err(Error::Internal(format!("blocking task failed: {e}")))),
                Err(_) => None,
            }
        })
    }

    /// Run every task concurrently and collect the results in input order.
    pub fn run_all<T, F>(&self, tasks: Vec<F>) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.runtime.block_on(async move {
            let handles: Vec<_> = tasks.into_iter().map(tokio::task::spawn_blocking).collect();
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(
                    handle
                        .await
                        .map_err(|e| Error::Internal(format!("blocking task failed: {e}"))),
                );
            }
            results
        })
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("workers", &WORKER_THREADS)
            .field("max_blocking_threads", &MAX_BLOCKING_THREADS)
            .finish()
    }
}
