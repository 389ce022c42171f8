// src/db.rs
//
// Fixed-size pool of SQLite handles. All handles are opened at init against
// the same database file; `acquire` blocks on a counting semaphore and takes
// the front handle under the pool mutex, and the returned guard puts it back
// on every exit path. Invariant: free + in_use == capacity.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection};

use crate::error::{RavelError, RavelResult};
use crate::sync::Semaphore;

const SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS user (username TEXT PRIMARY KEY, passwd TEXT NOT NULL)";

pub struct DbPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    handles: std::sync::Mutex<VecDeque<Connection>>,
    available: Semaphore,
    capacity: usize,
}

impl DbPool {
    /// Open `capacity` live handles. The parent directory is created on
    /// demand and the schema is applied through the first handle.
    pub fn open(path: &Path, capacity: usize) -> RavelResult<Self> {
        if capacity == 0 {
            return Err(RavelError::Startup("database pool size must be positive".into()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut handles = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            let conn = Connection::open(path)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            if i == 0 {
                conn.execute(SCHEMA, [])?;
            }
            handles.push_back(conn);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                handles: std::sync::Mutex::new(handles),
                available: Semaphore::new(capacity),
                capacity,
            }),
        })
    }

    /// Block until a handle is free, then check it out.
    pub fn acquire(&self) -> PooledConn {
        self.inner.available.wait();
        let conn = self
            .inner
            .handles
            .lock()
            .unwrap()
            .pop_front()
            .expect("semaphore said a handle was free");
        PooledConn {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn free_count(&self) -> usize {
        self.inner.handles.lock().unwrap().len()
    }

    /// Startup snapshot of the credentials table.
    pub fn load_users(&self) -> RavelResult<HashMap<String, String>> {
        let conn = self.acquire();
        let mut stmt = conn.prepare("SELECT username, passwd FROM user")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut users = HashMap::new();
        for row in rows {
            let (name, passwd) = row?;
            users.insert(name, passwd);
        }
        Ok(users)
    }
}

impl Clone for DbPool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Scoped handle: dropping it returns the connection to the pool and posts
/// the semaphore, exceptions included.
pub struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("handle already returned")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.handles.lock().unwrap().push_back(conn);
            self.pool.available.post();
        }
    }
}

/// Parameterized insert; a duplicate username surfaces as a constraint error.
pub fn insert_user(conn: &Connection, username: &str, passwd: &str) -> RavelResult<()> {
    conn.execute(
        "INSERT INTO user (username, passwd) VALUES (?1, ?2)",
        params![username, passwd],
    )?;
    Ok(())
}
