//! Fixed-size worker pool fed by a bounded `TaskQueue`.
//!
//! Every worker runs the same loop for its whole life: pop a task, run the
//! injected handler on it, repeat. Handler errors and panics are logged and
//! the worker moves on to the next task.
//!
//! ## Shutdown
//!
//! Shutdown is cooperative. `shutdown` raises a flag checked between tasks,
//! closes the queue (waking idle workers), releases tasks still queued and
//! waits up to a grace period. Threads cannot be killed in place, so a
//! worker still stuck in a handler after the grace period is detached and
//! reported rather than joined.

use super::queue::{PushError, TaskQueue};
use super::{accept_loop, serve, ConnectionCounter, ShutdownHandle, Task};
use crate::config::{Config, OverflowPolicy};
use crate::handler::Handler;
use std::io;
use std::net::TcpListener;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Grace period used when a pool is dropped without an explicit shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Job<T> = Arc<dyn Fn(T) -> io::Result<()> + Send + Sync>;

struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

/// A fixed set of long-lived worker threads sharing one task queue.
pub struct WorkerPool<T: Send + 'static> {
    queue: Arc<TaskQueue<T>>,
    workers: Vec<Worker>,
    shutdown: Arc<AtomicBool>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `size` workers sharing a queue of `queue_capacity` tasks.
    ///
    /// `handler` is invoked once per task, on whichever worker pops it.
    pub fn new<F>(size: usize, queue_capacity: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(T) -> io::Result<()> + Send + Sync + 'static,
    {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one worker",
            ));
        }

        let queue = TaskQueue::new(queue_capacity)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let queue = Arc::new(queue);
        let handler: Job<T> = Arc::new(handler);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut pool = Self {
            queue,
            workers: Vec::with_capacity(size),
            shutdown,
        };

        for id in 0..size {
            let queue = Arc::clone(&pool.queue);
            let handler = Arc::clone(&handler);
            let shutdown = Arc::clone(&pool.shutdown);

            // On failure `pool` is dropped, which stops the workers already spawned
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_loop(id, &queue, &handler, &shutdown))?;

            pool.workers.push(Worker {
                id,
                handle: Some(handle),
            });
        }

        info!(workers = size, queue_capacity, "Worker pool started");
        Ok(pool)
    }

    /// Queue a task, blocking while the queue is full.
    pub fn execute(&self, task: T) -> Result<(), PushError<T>> {
        self.queue.push(task)
    }

    /// Queue a task only if there is room right now.
    pub fn try_execute(&self, task: T) -> Result<(), PushError<T>> {
        self.queue.try_push(task)
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop all workers, waiting at most `grace` for busy ones.
    ///
    /// Returns the number of workers that were still running a handler
    /// when the grace period ran out and had to be detached.
    pub fn shutdown(&mut self, grace: Duration) -> usize {
        self.shutdown.store(true, Ordering::Release);
        self.queue.close();

        let dropped = self.queue.drain();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Releasing queued tasks");
        }
        drop(dropped);

        let deadline = Instant::now() + grace;
        let mut detached = 0;

        for worker in &mut self.workers {
            let Some(handle) = worker.handle.take() else {
                continue;
            };

            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }

            if handle.is_finished() {
                if handle.join().is_err() {
                    error!(worker = worker.id, "Worker thread panicked");
                }
            } else {
                warn!(worker = worker.id, "Worker still busy after grace period, detaching");
                detached += 1;
            }
        }

        info!(detached, "Worker pool stopped");
        detached
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if self.workers.iter().any(|w| w.handle.is_some()) {
            self.shutdown(DEFAULT_SHUTDOWN_GRACE);
        }
    }
}

/// Serve connections from `listener` with a worker pool.
///
/// Under the `block` overflow policy a full queue stalls the acceptor,
/// which pushes back on clients through the listen backlog. Under
/// `reject` the new connection is closed instead.
pub(super) fn run(
    listener: &TcpListener,
    config: &Config,
    handler: Arc<dyn Handler>,
    shutdown: &ShutdownHandle,
) -> io::Result<()> {
    let mut pool = WorkerPool::new(config.workers, config.queue_capacity, move |task: Task| {
        let waited = task.queued_for();
        let mut conn = task.into_connection();
        trace!(conn = conn.id(), waited_us = waited.as_micros() as u64, "Dequeued connection");
        serve(handler.as_ref(), &mut conn);
        Ok(())
    })?;

    let counter = ConnectionCounter::new();
    let overflow = config.overflow;

    accept_loop(listener, config, shutdown, &counter, |conn| {
        let task = Task::new(conn);
        let result = match overflow {
            OverflowPolicy::Block => pool.execute(task),
            OverflowPolicy::Reject => pool.try_execute(task),
        };

        match result {
            Ok(()) => {}
            Err(PushError::Full(task)) => {
                let conn = task.into_connection();
                warn!(conn = conn.id(), peer = %conn.peer(), "Task queue full, rejecting connection");
            }
            Err(PushError::Closed(task)) => {
                debug!(conn = task.into_connection().id(), "Pool closed, dropping connection");
            }
        }
    })?;

    pool.shutdown(DEFAULT_SHUTDOWN_GRACE);
    Ok(())
}

fn worker_loop<T>(id: usize, queue: &TaskQueue<T>, handler: &Job<T>, shutdown: &AtomicBool) {
    debug!(worker = id, "Worker started");

    while !shutdown.load(Ordering::Acquire) {
        let Some(task) = queue.pop() else {
            break;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(task))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(worker = id, error = %e, "Handler failed"),
            Err(_) => error!(worker = id, "Handler panicked"),
        }
    }

    debug!(worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = WorkerPool::<u32>::new(0, 4, |_| Ok(())).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = WorkerPool::<u32>::new(1, 0, |_| Ok(())).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_tasks_reach_distinct_workers() {
        const WORKERS: usize = 4;

        // Each task waits until all of them are running at once, which is
        // only possible if every task landed on its own worker.
        let running = Arc::new(AtomicUsize::new(0));
        let names = Arc::new(Mutex::new(HashSet::new()));

        let mut pool = {
            let running = Arc::clone(&running);
            let names = Arc::clone(&names);
            WorkerPool::new(WORKERS, WORKERS, move |_: usize| {
                names
                    .lock()
                    .insert(thread::current().name().unwrap_or_default().to_string());
                running.fetch_add(1, Ordering::SeqCst);
                assert!(wait_until(Duration::from_secs(5), || {
                    running.load(Ordering::SeqCst) >= WORKERS
                }));
                Ok(())
            })
            .unwrap()
        };

        for i in 0..WORKERS {
            pool.execute(i).unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || names.lock().len() == WORKERS));
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.shutdown(Duration::from_secs(5)), 0);

        let names = names.lock();
        assert!(names.iter().all(|n| n.starts_with("worker-")));
    }

    #[test]
    fn test_bounded_pool_runs_every_task_once() {
        // Pool of 2 with room for 4, fed 6 tasks by 3 producers
        let executed = Arc::new(Mutex::new(Vec::new()));
        let pool = {
            let executed = Arc::clone(&executed);
            WorkerPool::new(2, 4, move |task: usize| {
                thread::sleep(Duration::from_millis(10));
                executed.lock().push(task);
                Ok(())
            })
            .unwrap()
        };
        let pool = Arc::new(pool);

        let producers: Vec<_> = (0..3)
            .map(|p| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..2 {
                        pool.execute(p * 2 + i).unwrap();
                        assert!(pool.queued() <= 4);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || executed.lock().len() == 6));

        let mut seen = executed.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_failing_and_panicking_handlers_keep_pool_alive() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let mut pool = WorkerPool::new(1, 4, move |task: u32| match task {
            0 => Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")),
            1 => panic!("bad connection"),
            n => {
                tx.lock().send(n).unwrap();
                Ok(())
            }
        })
        .unwrap();

        pool.execute(0).unwrap();
        pool.execute(1).unwrap();
        pool.execute(2).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(pool.shutdown(Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_try_execute_rejects_when_full() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let started = Arc::new(AtomicBool::new(false));

        let mut pool = {
            let started = Arc::clone(&started);
            WorkerPool::new(1, 1, move |_: u32| {
                started.store(true, Ordering::SeqCst);
                let _ = release_rx.lock().recv();
                Ok(())
            })
            .unwrap()
        };

        pool.execute(1).unwrap();
        assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst)));

        // Worker is busy; one slot left in the queue
        pool.try_execute(2).unwrap();
        assert_eq!(pool.try_execute(3), Err(PushError::Full(3)));

        drop(release_tx);
        pool.shutdown(Duration::from_secs(5));
        assert_eq!(pool.execute(4), Err(PushError::Closed(4)));
    }

    #[test]
    fn test_shutdown_detaches_stuck_worker() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let started = Arc::new(AtomicBool::new(false));

        let mut pool = {
            let started = Arc::clone(&started);
            WorkerPool::new(2, 2, move |_: u32| {
                started.store(true, Ordering::SeqCst);
                let _ = release_rx.lock().recv();
                Ok(())
            })
            .unwrap()
        };

        pool.execute(1).unwrap();
        assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst)));

        assert_eq!(pool.size(), 2);
        assert_eq!(pool.shutdown(Duration::from_millis(50)), 1);
        drop(release_tx);
    }

    #[test]
    fn test_reject_policy_closes_overflow_connections() {
        use crate::config::DispatchMode;
        use crate::runtime::{Connection, Server};
        use std::io::{Read, Write};
        use std::net::TcpStream;

        let config = Config {
            mode: DispatchMode::ThreadPool,
            listen: "127.0.0.1:0".to_string(),
            workers: 1,
            queue_capacity: 1,
            overflow: OverflowPolicy::Reject,
            ..Config::default()
        };
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let started = Arc::new(AtomicUsize::new(0));

        let runner = {
            let started = Arc::clone(&started);
            thread::spawn(move || {
                server.run(move |conn: &mut Connection| {
                    started.fetch_add(1, Ordering::SeqCst);
                    let _ = release_rx.lock().recv();
                    conn.write_all(b"ok")
                })
            })
        };

        let connect = || {
            let client = TcpStream::connect(addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            client
        };
        let read_reply = |mut client: TcpStream| {
            let mut reply = Vec::new();
            client.read_to_end(&mut reply).unwrap();
            reply
        };

        // One connection occupies the only worker, the next fills the queue
        let busy = connect();
        assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 1));
        let queued = connect();

        // Everything past that is closed on accept, without a reply
        for _ in 0..2 {
            let mut rejected = connect();
            let mut buf = [0u8; 2];
            match rejected.read(&mut buf) {
                Ok(n) => assert_eq!(n, 0),
                Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            }
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);

        drop(release_tx);
        assert_eq!(read_reply(busy), b"ok");
        assert_eq!(read_reply(queued), b"ok");

        // The server keeps serving once the queue has room again
        assert_eq!(read_reply(connect()), b"ok");
        assert_eq!(started.load(Ordering::SeqCst), 3);

        shutdown.shutdown();
        runner.join().unwrap().unwrap();
    }
}
