// src/server.rs
//
// The reactor: one thread owning the listen socket, the epoll instance, the
// signal self-pipe, the connection table and the timer list. Workers only
// ever see connections the reactor checked out to them via the one-shot
// registration, and signal the reactor back through the per-connection
// improv/timer_flag pair.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::{ActorModel, Config, TriggerMode};
use crate::conn::{ConnHandle, Connection};
use crate::db::DbPool;
use crate::error::RavelResult;
use crate::stats::{unix_now, Stats};
use crate::syscalls::{self, Epoll, ReadOutcome};
use crate::timer::TimerList;
use crate::util;
use crate::workers::{TaskRole, WorkerPool};

/// Connection-table cap; accepts past this draw a busy notice and a close.
pub const MAX_FD: usize = 10000;

/// Upper bound on events drained per epoll wait.
pub const MAX_EVENT_NUMBER: usize = 10000;

/// Timer tick period in seconds; idle connections close after three ticks.
pub const TIMESLOT: u64 = 5;

/// Bounded worker FIFO depth.
const MAX_PENDING_TASKS: usize = 10000;

/// Poll cadence for the worker handshake: 100 µs sleeps, 100 ms cap.
const IMPROV_POLL_STEPS: u32 = 1000;
const IMPROV_POLL_PAUSE: Duration = Duration::from_micros(100);

const BUSY_NOTICE: &[u8] = b"Internal server busy";

/// Process-wide state shared between the reactor and the workers. Built
/// once at startup and passed by `Arc`; nothing here is a global.
pub struct ServerCtx {
    pub epoll: Epoll,
    pub stats: Stats,
    pub users: Mutex<HashMap<String, String>>,
    pub db: DbPool,
    pub webroot: PathBuf,
    pub conn_trigger: TriggerMode,
}

impl ServerCtx {
    pub fn new(webroot: PathBuf, db: DbPool, conn_trigger: TriggerMode) -> RavelResult<Self> {
        let users = db.load_users()?;
        info!("loaded {} user(s) from the database", users.len());
        Ok(Self {
            epoll: Epoll::new()?,
            stats: Stats::new(),
            users: Mutex::new(users),
            db,
            webroot,
            conn_trigger,
        })
    }
}

pub struct Server {
    ctx: Arc<ServerCtx>,
    config: Config,
    listen_fd: RawFd,
    pipe_read: RawFd,
    pipe_write: RawFd,
    connections: Vec<Option<Arc<ConnHandle>>>,
    timer_slots: Vec<Option<usize>>,
    timers: TimerList,
    pool: WorkerPool,
}

impl Server {
    /// Full startup: database pool, context, listen socket, self-pipe,
    /// signal handlers, worker pool, periodic alarm.
    pub fn bind(config: Config) -> RavelResult<Self> {
        let db = DbPool::open(&config.database_path(), config.db_pool_size)?;
        let ctx = Arc::new(ServerCtx::new(config.webroot(), db, config.conn_trigger())?);

        let listen_fd = syscalls::create_listen_socket(config.port, config.linger())?;
        ctx.epoll.add(
            listen_fd,
            listen_fd as u64,
            syscalls::interest(libc::EPOLLIN as u32, config.listen_trigger(), false),
        )?;

        let (pipe_read, pipe_write) = syscalls::socket_pair()?;
        ctx.epoll.add(
            pipe_read,
            pipe_read as u64,
            syscalls::interest(libc::EPOLLIN as u32, TriggerMode::Level, false),
        )?;
        syscalls::install_signal_handlers(pipe_write)?;

        let pool = WorkerPool::new(config.workers, MAX_PENDING_TASKS, ctx.clone())?;
        syscalls::arm_alarm(TIMESLOT as u32);

        info!(
            "listening on port {} ({:?} listen / {:?} conn, {:?})",
            config.port,
            config.listen_trigger(),
            config.conn_trigger(),
            config.actor()
        );
        Ok(Self {
            ctx,
            config,
            listen_fd,
            pipe_read,
            pipe_write,
            connections: vec![None; MAX_FD],
            timer_slots: vec![None; MAX_FD],
            timers: TimerList::new(),
            pool,
        })
    }

    /// The event loop: block on epoll, fan ready fds out, then run the
    /// timer tick whenever the alarm byte arrived.
    pub fn run(&mut self) -> RavelResult<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENT_NUMBER];
        let mut timeout = false;
        let mut stop = false;

        while !stop {
            let ready = match self.ctx.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(err) => {
                    error!("epoll wait failed: {}", err);
                    return Err(err);
                }
            };
            for event in events.iter().take(ready) {
                let fd = event.u64 as RawFd;
                let mask = event.events;
                if fd == self.listen_fd {
                    self.accept_clients();
                } else if fd == self.pipe_read {
                    self.drain_signal_pipe(&mut timeout, &mut stop);
                } else if mask
                    & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32
                    != 0
                {
                    self.close_connection(fd);
                } else if mask & libc::EPOLLIN as u32 != 0 {
                    self.handle_read(fd);
                } else if mask & libc::EPOLLOUT as u32 != 0 {
                    self.handle_write(fd);
                }
            }
            if timeout {
                self.run_timer_tick();
                timeout = false;
            }
        }
        info!("terminate signal received; shutting down");
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(err) => {
                    error!("accept failed: {}", err);
                    break;
                }
            }
            // Level mode accepts one connection per notification.
            if self.config.listen_trigger() == TriggerMode::Level {
                break;
            }
        }
    }

    fn admit(&mut self, fd: RawFd, peer: Ipv4Addr) {
        if self.ctx.stats.connection_count() >= MAX_FD as i64 || fd as usize >= MAX_FD {
            warn!("connection table full, turning away fd {}", fd);
            syscalls::send_best_effort(fd, BUSY_NOTICE);
            syscalls::close_fd(fd);
            return;
        }
        syscalls::set_io_buffer_sizes(fd);

        let ip = util::normalize_peer(peer);
        self.ctx.stats.on_connect(&ip);
        let conn = Connection::new(fd, ip.clone(), self.ctx.conn_trigger);
        let events = syscalls::interest(libc::EPOLLIN as u32, self.ctx.conn_trigger, true);
        if let Err(err) = self.ctx.epoll.add(fd, fd as u64, events) {
            error!("registering fd {} failed: {}", fd, err);
            self.ctx.stats.on_disconnect(&ip);
            syscalls::close_fd(fd);
            return;
        }
        self.connections[fd as usize] = Some(ConnHandle::new(conn));
        let slot = self.timers.add(fd, unix_now() + 3 * TIMESLOT);
        self.timer_slots[fd as usize] = Some(slot);
        debug!("accepted fd {} from {}", fd, ip);
    }

    /// One recv drains the pending signal bytes; level triggering brings us
    /// back if more are queued.
    fn drain_signal_pipe(&mut self, timeout: &mut bool, stop: &mut bool) {
        let mut buf = [0u8; 1024];
        match syscalls::read_socket(self.pipe_read, &mut buf) {
            Ok(ReadOutcome::Data(n)) => {
                for &byte in &buf[..n] {
                    if byte == libc::SIGALRM as u8 {
                        *timeout = true;
                    } else if byte == libc::SIGTERM as u8 {
                        *stop = true;
                    }
                }
            }
            Ok(_) => {}
            Err(err) => error!("signal pipe read failed: {}", err),
        }
    }

    fn handle_read(&mut self, fd: RawFd) {
        let Some(handle) = self.connection(fd) else {
            return;
        };
        match self.config.actor() {
            ActorModel::Reactor => {
                self.adjust_conn_timer(fd);
                if !self.pool.append(handle.clone(), TaskRole::Read) {
                    warn!("task queue full, dropping fd {}", fd);
                    self.close_connection(fd);
                    return;
                }
                self.wait_for_worker(fd, &handle);
            }
            ActorModel::Proactor => {
                let ok = handle.conn.lock().unwrap().read_once();
                if ok {
                    if !self.pool.append_p(handle) {
                        warn!("task queue full, dropping fd {}", fd);
                        self.close_connection(fd);
                        return;
                    }
                    self.adjust_conn_timer(fd);
                } else {
                    self.close_connection(fd);
                }
            }
        }
    }

    fn handle_write(&mut self, fd: RawFd) {
        let Some(handle) = self.connection(fd) else {
            return;
        };
        match self.config.actor() {
            ActorModel::Reactor => {
                self.adjust_conn_timer(fd);
                if !self.pool.append(handle.clone(), TaskRole::Write) {
                    warn!("task queue full, dropping fd {}", fd);
                    self.close_connection(fd);
                    return;
                }
                self.wait_for_worker(fd, &handle);
            }
            ActorModel::Proactor => {
                let ok = handle.conn.lock().unwrap().write(&self.ctx);
                if ok {
                    self.adjust_conn_timer(fd);
                } else {
                    self.close_connection(fd);
                }
            }
        }
    }

    /// Bounded handshake with the worker that took this connection. If the
    /// cap is hit the reactor moves on; the worker finishes on its own and
    /// the one-shot re-arm resubscribes the fd.
    fn wait_for_worker(&mut self, fd: RawFd, handle: &Arc<ConnHandle>) {
        for _ in 0..IMPROV_POLL_STEPS {
            if handle.improv.load(Ordering::Acquire) {
                if handle.timer_flag.load(Ordering::Acquire) {
                    self.close_connection(fd);
                    handle.timer_flag.store(false, Ordering::Release);
                }
                handle.improv.store(false, Ordering::Release);
                return;
            }
            thread::sleep(IMPROV_POLL_PAUSE);
        }
    }

    fn connection(&self, fd: RawFd) -> Option<Arc<ConnHandle>> {
        self.connections.get(fd as usize)?.clone()
    }

    fn adjust_conn_timer(&mut self, fd: RawFd) {
        if let Some(Some(slot)) = self.timer_slots.get(fd as usize) {
            self.timers.adjust(*slot, unix_now() + 3 * TIMESLOT);
        }
    }

    /// Tear down one connection and its timer.
    fn close_connection(&mut self, fd: RawFd) {
        let idx = fd as usize;
        if idx >= MAX_FD {
            return;
        }
        if let Some(slot) = self.timer_slots[idx].take() {
            self.timers.remove(slot);
        }
        if let Some(handle) = self.connections[idx].take() {
            handle.conn.lock().unwrap().close(&self.ctx);
        }
    }

    /// Close every connection whose timer expired, then re-arm the alarm.
    fn run_timer_tick(&mut self) {
        let now = unix_now();
        let mut expired = Vec::new();
        self.timers.tick(now, |fd| expired.push(fd));
        for fd in expired {
            let idx = fd as usize;
            self.timer_slots[idx] = None;
            if let Some(handle) = self.connections[idx].take() {
                info!("idle timeout, closing fd {}", fd);
                handle.conn.lock().unwrap().close(&self.ctx);
            }
        }
        syscalls::arm_alarm(TIMESLOT as u32);
        debug!("timer tick");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for idx in 0..self.connections.len() {
            if let Some(handle) = self.connections[idx].take() {
                handle.conn.lock().unwrap().close(&self.ctx);
            }
        }
        syscalls::close_fd(self.listen_fd);
        syscalls::close_fd(self.pipe_read);
        syscalls::close_fd(self.pipe_write);
    }
}
