//! Background queue for side effects that must stay off the send path.
//!
//! A single worker owns a bounded FIFO. `submit` never blocks the caller;
//! when the queue is full the oldest pending task is dropped. Each job runs
//! on tokio's blocking pool, so a job that fails or panics is counted and
//! logged and nothing else notices.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};

use crate::metrics;
use crate::types::Message;

pub type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

pub struct TaskEnvelope {
    pub name: String,
    pub enqueued_at: Instant,
    job: Job,
}

impl TaskEnvelope {
    pub fn new<F>(name: &str, job: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            enqueued_at: Instant::now(),
            job: Box::new(job),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub max_queue: usize,
    /// Zero disables the periodic stats line.
    pub stats_interval_ms: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_queue: 256,
            stats_interval_ms: 60_000,
        }
    }
}

impl TaskQueueConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

enum TaskCommand {
    Submit(TaskEnvelope),
    Snapshot(oneshot::Sender<TaskStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub queued: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub dropped_total: u64,
}

#[derive(Clone, Debug)]
pub struct TaskHandle {
    tx: mpsc::UnboundedSender<TaskCommand>,
}

impl TaskHandle {
    /// Queue a job. Returns false when the worker is gone.
    pub fn submit<F>(&self, name: &str, job: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.tx
            .send(TaskCommand::Submit(TaskEnvelope::new(name, job)))
            .is_ok()
    }

    /// Stop accepting work, run what is already queued, then return.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(TaskCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn snapshot(&self) -> Option<TaskStats> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(TaskCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }
}

/// Out-of-band notification for recipients of a message (e-mail and the like).
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, message: &Message, recipients: &[String]) -> anyhow::Result<()>;
}

/// Notifier that only writes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &Message, recipients: &[String]) -> anyhow::Result<()> {
        log::info!(
            "notify {} recipient(s) of message id={} room={}",
            recipients.len(),
            message.id,
            message.room_id
        );
        Ok(())
    }
}

/// Spawn the worker. Must be called from within a tokio runtime.
pub fn start_task_queue(cfg: TaskQueueConfig) -> TaskHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<TaskCommand>();
    let handle = TaskHandle { tx };

    tokio::spawn(async move {
        let mut queue: VecDeque<TaskEnvelope> = VecDeque::new();
        let mut stats = TaskStats::default();
        let mut shutdown: Option<oneshot::Sender<()>> = None;
        let mut last_stats_log = Instant::now();
        loop {
            if queue.is_empty() {
                if shutdown.is_some() {
                    break;
                }
                match rx.recv().await {
                    Some(cmd) => accept(cmd, &cfg, &mut queue, &mut stats, &mut shutdown),
                    None => break,
                }
            }
            while let Ok(cmd) = rx.try_recv() {
                accept(cmd, &cfg, &mut queue, &mut stats, &mut shutdown);
            }

            if cfg.stats_interval_ms > 0 && last_stats_log.elapsed() >= cfg.stats_interval() {
                debug!(
                    "task queue stats: queued={} completed_total={} failed_total={} dropped_total={}",
                    queue.len(),
                    stats.completed_total,
                    stats.failed_total,
                    stats.dropped_total
                );
                last_stats_log = Instant::now();
            }

            if let Some(env) = queue.pop_front() {
                run(env, &mut stats).await;
            }
        }
        if let Some(done) = shutdown {
            let _ = done.send(());
        }
        debug!("task queue terminated");
    });

    handle
}

fn accept(
    cmd: TaskCommand,
    cfg: &TaskQueueConfig,
    queue: &mut VecDeque<TaskEnvelope>,
    stats: &mut TaskStats,
    shutdown: &mut Option<oneshot::Sender<()>>,
) {
    match cmd {
        TaskCommand::Submit(env) => {
            if shutdown.is_some() {
                stats.dropped_total += 1;
                metrics::inc_tasks_dropped();
                warn!("task queue shutting down: rejected task {}", env.name);
                return;
            }
            if queue.len() >= cfg.max_queue.max(1) {
                if let Some(victim) = queue.pop_front() {
                    stats.dropped_total += 1;
                    metrics::inc_tasks_dropped();
                    warn!(
                        "task queue overflow: dropped task {} queued {:?} ago",
                        victim.name,
                        victim.enqueued_at.elapsed()
                    );
                }
            }
            queue.push_back(env);
        }
        TaskCommand::Snapshot(resp) => {
            let _ = resp.send(TaskStats {
                queued: queue.len(),
                ..*stats
            });
        }
        TaskCommand::Shutdown(done) => {
            // A second shutdown request supersedes the first; ack the earlier caller now.
            if let Some(previous) = shutdown.replace(done) {
                let _ = previous.send(());
            }
        }
    }
}

async fn run(env: TaskEnvelope, stats: &mut TaskStats) {
    let TaskEnvelope {
        name,
        enqueued_at,
        job,
    } = env;
    match tokio::task::spawn_blocking(job).await {
        Ok(Ok(())) => {
            stats.completed_total += 1;
            metrics::inc_tasks_completed();
            debug!("task {} done {:?} after enqueue", name, enqueued_at.elapsed());
        }
        Ok(Err(e)) => {
            stats.failed_total += 1;
            metrics::inc_tasks_failed();
            warn!("task {} failed: {:#}", name, e);
        }
        Err(e) => {
            stats.failed_total += 1;
            metrics::inc_tasks_failed();
            error!("task {} panicked: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn cfg(max_queue: usize) -> TaskQueueConfig {
        TaskQueueConfig {
            max_queue,
            stats_interval_ms: 0,
        }
    }

    #[tokio::test]
    async fn runs_jobs_in_submission_order() {
        let handle = start_task_queue(cfg(16));
        let ran = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let ran = ran.clone();
            assert!(handle.submit("push", move || {
                ran.lock().unwrap().push(i);
                Ok(())
            }));
        }
        handle.shutdown().await;
        assert_eq!(*ran.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let handle = start_task_queue(cfg(16));
        handle.submit("fails", || anyhow::bail!("smtp down"));
        handle.submit("panics", || panic!("boom"));
        handle.submit("fine", || Ok(()));

        let stats = loop {
            let stats = handle.snapshot().await.expect("worker alive");
            if stats.completed_total + stats.failed_total == 3 {
                break stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(stats.failed_total, 2);
        assert_eq!(stats.completed_total, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest_pending_task() {
        let handle = start_task_queue(cfg(2));
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        handle.submit("blocker", move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        });
        started_rx.await.expect("blocker started");

        let ran = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let ran = ran.clone();
            handle.submit(name, move || {
                ran.lock().unwrap().push(name);
                Ok(())
            });
        }
        release_tx.send(()).expect("release");
        handle.shutdown().await;

        assert_eq!(*ran.lock().unwrap(), vec!["second", "third"]);
    }

    #[tokio::test]
    async fn submit_after_worker_exit_reports_false() {
        let handle = start_task_queue(cfg(4));
        handle.shutdown().await;
        // Give the worker a moment to drop its receiver.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.submit("late", || Ok(())));
        assert!(handle.snapshot().await.is_none());
    }
}
