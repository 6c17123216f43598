//! Deferred work queue.
//!
//! Work that must not delay the response (title upgrades, notification
//! sends) is enqueued here and executed after the stream has flushed. In
//! production a worker drains the queue continuously; tests call
//! [`BackgroundQueue::drain`] to flush synchronously and then assert on
//! the side effects.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct Job {
    label: &'static str,
    work: BoxFuture<'static, ()>,
}

/// FIFO queue of fire-and-forget jobs.
#[derive(Clone, Default)]
pub struct BackgroundQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: Mutex<VecDeque<Job>>,
    wake: Notify,
}

impl BackgroundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job. Jobs run outside the request path and own all
    /// their state; they cannot fail the request that spawned them.
    pub fn enqueue<F>(&self, label: &'static str, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut jobs = match self.inner.jobs.lock() {
            Ok(jobs) => jobs,
            Err(poisoned) => poisoned.into_inner(),
        };
        jobs.push_back(Job {
            label,
            work: Box::pin(work),
        });
        drop(jobs);
        self.inner.wake.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        let mut jobs = match self.inner.jobs.lock() {
            Ok(jobs) => jobs,
            Err(poisoned) => poisoned.into_inner(),
        };
        jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        match self.inner.jobs.lock() {
            Ok(jobs) => jobs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every queued job to completion, in order. Returns the number
    /// of jobs executed.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.pop() {
            tracing::debug!(job = job.label, "running background job");
            job.work.await;
            ran += 1;
        }
        ran
    }

    /// Spawn a worker task that drains the queue whenever jobs arrive.
    pub fn spawn_worker(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                queue.drain().await;
                queue.inner.wake.notified().await;
            }
        })
    }
}
