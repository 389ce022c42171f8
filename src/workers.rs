// src/workers.rs
//
// Fixed pool of detached worker threads behind a bounded FIFO of
// (connection, role) tasks. Reactor mode tags each task with the I/O the
// worker must perform; proactor tasks skip the tag because the reactor
// already did the read.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::conn::ConnHandle;
use crate::error::{RavelError, RavelResult};
use crate::server::ServerCtx;
use crate::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    /// Worker performs the read, then parses and stages the response.
    Read,
    /// Worker drains the staged response.
    Write,
    /// Proactor handoff: bytes already read, worker only processes.
    Process,
}

struct TaskQueue {
    tasks: Mutex<VecDeque<(Arc<ConnHandle>, TaskRole)>>,
    task_available: Semaphore,
    max_requests: usize,
}

impl TaskQueue {
    fn push(&self, task: (Arc<ConnHandle>, TaskRole)) -> bool {
        {
            let mut tasks = self.tasks.lock().unwrap();
            if tasks.len() >= self.max_requests {
                return false;
            }
            tasks.push_back(task);
        }
        self.task_available.post();
        true
    }

    fn pop(&self) -> (Arc<ConnHandle>, TaskRole) {
        loop {
            self.task_available.wait();
            if let Some(task) = self.tasks.lock().unwrap().pop_front() {
                return task;
            }
        }
    }
}

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
}

impl WorkerPool {
    /// Spawn `thread_count` detached workers. Zero-sized parameters or a
    /// failed spawn abort startup.
    pub fn new(
        thread_count: usize,
        max_requests: usize,
        ctx: Arc<ServerCtx>,
    ) -> RavelResult<Self> {
        if thread_count == 0 || max_requests == 0 {
            return Err(RavelError::Startup(
                "worker count and queue size must be positive".into(),
            ));
        }
        let queue = Arc::new(TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            task_available: Semaphore::new(0),
            max_requests,
        });
        for i in 0..thread_count {
            let queue = queue.clone();
            let ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("ravel-worker-{}", i))
                .spawn(move || worker_loop(queue, ctx))
                .map_err(|err| {
                    RavelError::Startup(format!("spawning worker {}: {}", i, err))
                })?;
        }
        Ok(Self { queue })
    }

    /// Reactor-mode enqueue with a role tag; false when the queue is full.
    pub fn append(&self, conn: Arc<ConnHandle>, role: TaskRole) -> bool {
        self.queue.push((conn, role))
    }

    /// Proactor-mode enqueue; the worker processes unconditionally.
    pub fn append_p(&self, conn: Arc<ConnHandle>) -> bool {
        self.queue.push((conn, TaskRole::Process))
    }
}

fn worker_loop(queue: Arc<TaskQueue>, ctx: Arc<ServerCtx>) {
    loop {
        let (handle, role) = queue.pop();
        match role {
            TaskRole::Read => {
                let ok = handle.conn.lock().unwrap().read_once();
                if ok {
                    let db = ctx.db.acquire();
                    handle.conn.lock().unwrap().process(&ctx, &db);
                } else {
                    handle.timer_flag.store(true, Ordering::Release);
                }
                handle.improv.store(true, Ordering::Release);
            }
            TaskRole::Write => {
                let ok = handle.conn.lock().unwrap().write(&ctx);
                if !ok {
                    handle.timer_flag.store(true, Ordering::Release);
                }
                handle.improv.store(true, Ordering::Release);
            }
            TaskRole::Process => {
                let db = ctx.db.acquire();
                let mut conn = handle.conn.lock().unwrap();
                if !conn.is_open() {
                    continue;
                }
                conn.process(&ctx, &db);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerMode;
    use crate::conn::Connection;

    fn dummy_handle() -> Arc<ConnHandle> {
        ConnHandle::new(Connection::new(-1, "local".into(), TriggerMode::Level))
    }

    #[test]
    fn queue_rejects_past_capacity() {
        let queue = TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            task_available: Semaphore::new(0),
            max_requests: 2,
        };
        assert!(queue.push((dummy_handle(), TaskRole::Read)));
        assert!(queue.push((dummy_handle(), TaskRole::Write)));
        assert!(!queue.push((dummy_handle(), TaskRole::Read)));
        let (_, role) = queue.pop();
        assert_eq!(role, TaskRole::Read);
        assert!(queue.push((dummy_handle(), TaskRole::Process)));
    }

    #[test]
    fn pop_skips_nothing_and_preserves_fifo() {
        let queue = TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            task_available: Semaphore::new(0),
            max_requests: 8,
        };
        for role in [TaskRole::Read, TaskRole::Write, TaskRole::Process] {
            assert!(queue.push((dummy_handle(), role)));
        }
        assert_eq!(queue.pop().1, TaskRole::Read);
        assert_eq!(queue.pop().1, TaskRole::Write);
        assert_eq!(queue.pop().1, TaskRole::Process);
    }
}
