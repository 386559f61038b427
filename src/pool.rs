//! Bounded worker pool
//!
//! Workers are spawned lazily, up to `max_workers`, whenever a task arrives
//! and the idle workers are already spoken for by queued tasks. Each worker
//! then lives until it takes a stop marker off the queue. A worker counts as
//! idle exactly while it waits on the channel, so there is no separate idle
//! list to keep in sync.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use parking_lot::Mutex;

use crate::logger::Logger;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

struct Shared {
    receiver: Mutex<Receiver<Message>>,
    idle: AtomicUsize,
    live: AtomicUsize,
    /// Tasks sent but not yet taken by a worker
    pending: AtomicUsize,
    terminated: AtomicBool,
    logger: Arc<dyn Logger>,
}

pub struct WorkerPool {
    max_workers: usize,
    sender: Mutex<Sender<Message>>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(max_workers: usize, logger: Arc<dyn Logger>) -> Self {
        let (tx, rx) = channel();
        Self {
            max_workers: max_workers.max(1),
            sender: Mutex::new(tx),
            shared: Arc::new(Shared {
                receiver: Mutex::new(rx),
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                terminated: AtomicBool::new(false),
                logger,
            }),
            handles: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn idle_workers(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    /// Queue a task. Never blocks; excess tasks wait for a free worker.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.shared.terminated.load(Ordering::SeqCst) {
            self.shared.logger.error("pool", "task submitted after terminate; dropped");
            return;
        }
        let mut handles = self.handles.lock();
        let pending = self.shared.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if self.shared.idle.load(Ordering::SeqCst) < pending {
            self.spawn_worker(&mut handles);
        }
        if self.sender.lock().send(Message::Run(Box::new(task))).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Queue a task whose successful result is handed to `callback`.
    /// A failing callback is logged like a failing task.
    pub fn execute_with_callback<F, T, C>(&self, task: F, callback: C)
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(T) -> Result<()> + Send + 'static,
        T: 'static,
    {
        let logger = Arc::clone(&self.shared.logger);
        self.execute(move || {
            let value = task()?;
            if let Err(e) = callback(value) {
                logger.error("pool callback", &format!("{:#}", e));
            }
            Ok(())
        });
    }

    /// Graceful drain: one stop marker per live worker, queued behind any
    /// pending tasks.
    pub fn close(&self) {
        let tx = self.sender.lock();
        for _ in 0..self.live_workers() {
            let _ = tx.send(Message::Stop);
        }
    }

    /// Forced shutdown: workers stop after their current task and queued
    /// tasks are discarded.
    pub fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        let tx = self.sender.lock();
        for _ in 0..self.live_workers() {
            let _ = tx.send(Message::Stop);
        }
    }

    /// Block until every worker thread has exited.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }

    /// Caller holds the handles lock, which serializes submissions.
    fn spawn_worker(&self, handles: &mut Vec<JoinHandle<()>>) {
        if self.shared.live.load(Ordering::SeqCst) >= self.max_workers {
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        match thread::Builder::new()
            .name(format!("ferry-worker-{}", id))
            .spawn(move || worker_loop(shared))
        {
            Ok(h) => handles.push(h),
            Err(e) => {
                self.shared.live.fetch_sub(1, Ordering::SeqCst);
                self.shared
                    .logger
                    .error("pool", &format!("failed to spawn worker: {}", e));
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.terminated.load(Ordering::SeqCst) {
            break;
        }
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let msg = shared.receiver.lock().recv();
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match msg {
            Ok(Message::Run(job)) => {
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                if shared.terminated.load(Ordering::SeqCst) {
                    break;
                }
                run_job(&shared, job);
            }
            Ok(Message::Stop) | Err(_) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::SeqCst);
}

fn run_job(shared: &Shared, job: Job) {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => shared.logger.error("pool task", &format!("{:#}", e)),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            shared.logger.error("pool task", &format!("panicked: {}", msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingLogger {
        errors: Mutex<Vec<String>>,
    }

    impl Logger for CountingLogger {
        fn error(&self, context: &str, msg: &str) {
            self.errors.lock().push(format!("{}: {}", context, msg));
        }
    }

    #[test]
    fn runs_every_task_once_within_bound() {
        let pool = WorkerPool::new(3, Arc::new(NoopLogger));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20usize {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let seen = Arc::clone(&seen);
            pool.execute(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                seen.lock().push(i);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
            assert!(pool.live_workers() <= 3);
        }
        pool.close();
        pool.join();

        let seen = seen.lock();
        assert_eq!(seen.len(), 20);
        let unique: HashSet<usize> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.live_workers(), 0);
    }

    #[test]
    fn failing_and_panicking_tasks_do_not_kill_workers() {
        let logger = Arc::new(CountingLogger::default());
        let pool = WorkerPool::new(1, logger.clone());
        let (tx, rx) = mpsc::channel();

        pool.execute(|| anyhow::bail!("handler blew up"));
        pool.execute(|| panic!("worse"));
        pool.execute(move || {
            tx.send(thread::current().name().map(str::to_string)).ok();
            Ok(())
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("ferry-worker-0"));
        assert_eq!(pool.live_workers(), 1);

        pool.close();
        pool.join();
        let errors = logger.errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("handler blew up"));
        assert!(errors[1].contains("worse"));
    }

    #[test]
    fn callback_receives_result_and_its_failure_is_logged() {
        let logger = Arc::new(CountingLogger::default());
        let pool = WorkerPool::new(2, logger.clone());
        let (tx, rx) = mpsc::channel();

        pool.execute_with_callback(
            || Ok(21 * 2),
            move |v: i32| {
                tx.send(v).ok();
                Ok(())
            },
        );
        pool.execute_with_callback(|| Ok(()), |_| anyhow::bail!("callback broke"));
        // Callback never runs when the task fails
        pool.execute_with_callback(
            || -> Result<()> { anyhow::bail!("task broke") },
            |_| panic!("must not run"),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.close();
        pool.join();

        let errors = logger.errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.starts_with("pool callback") && e.contains("callback broke")));
        assert!(errors.iter().any(|e| e.starts_with("pool task") && e.contains("task broke")));
    }

    #[test]
    fn idle_worker_is_reused() {
        let pool = WorkerPool::new(4, Arc::new(NoopLogger));
        for _ in 0..5 {
            let (tx, rx) = mpsc::channel();
            pool.execute(move || {
                tx.send(()).ok();
                Ok(())
            });
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            // Let the worker get back to waiting on the queue
            for _ in 0..100 {
                if pool.idle_workers() == pool.live_workers() {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(pool.live_workers(), 1);
        pool.close();
        pool.join();
    }

    fn wait_until_idle(pool: &WorkerPool) {
        for _ in 0..500 {
            if pool.live_workers() > 0 && pool.idle_workers() == pool.live_workers() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("pool never went idle");
    }

    #[test]
    fn back_to_back_tasks_do_not_share_one_idle_worker() {
        let pool = WorkerPool::new(4, Arc::new(NoopLogger));
        for _ in 0..50 {
            // Warm up to exactly the workers already alive, all idle
            pool.execute(|| Ok(()));
            wait_until_idle(&pool);

            let (started_tx, started_rx) = mpsc::channel();
            let mut releases = Vec::new();
            for _ in 0..2 {
                let started_tx = started_tx.clone();
                let (release_tx, release_rx) = mpsc::channel::<()>();
                releases.push(release_tx);
                pool.execute(move || {
                    started_tx.send(()).ok();
                    release_rx.recv_timeout(Duration::from_secs(5)).ok();
                    Ok(())
                });
            }

            // Both long-running tasks must be running at once
            for _ in 0..2 {
                started_rx
                    .recv_timeout(Duration::from_secs(2))
                    .expect("second task starved behind the first");
            }
            for r in releases {
                r.send(()).ok();
            }
        }
        assert!(pool.live_workers() <= 4);
        pool.close();
        pool.join();
    }

    #[test]
    fn terminate_discards_queued_tasks() {
        let pool = WorkerPool::new(1, Arc::new(NoopLogger));
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        {
            let ran = Arc::clone(&ran);
            pool.execute(move || {
                started_tx.send(()).ok();
                release_rx.recv().ok();
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            pool.execute(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        pool.terminate();
        release_tx.send(()).unwrap();
        pool.join();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.live_workers(), 0);
    }
}
