// src/logger.rs
//
// Process-wide leveled logger behind the `log` facade. The sink writes
// `YYYY-MM-DD HH:MM:SS.uuuuuu [level] message` lines to a date-prefixed file
// and rotates when the calendar day changes or the line counter reaches a
// multiple of `rotate_lines`. With a queue size > 0 the sink runs in async
// mode: producers push formatted lines into a bounded queue and a single
// background thread drains them; a full queue falls back to a direct write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{Datelike, Local};
use log::{LevelFilter, Metadata, Record};

use crate::error::{RavelError, RavelResult};
use crate::queue::BlockingQueue;

pub struct LogSink {
    file: Mutex<LogFile>,
    rotate_lines: u64,
}

struct LogFile {
    out: File,
    dir: PathBuf,
    base: String,
    day: u32,
    count: u64,
}

fn dated_name(dir: &Path, base: &str, suffix: Option<u64>) -> PathBuf {
    let now = Local::now();
    let stem = format!(
        "{:04}_{:02}_{:02}_{}",
        now.year(),
        now.month(),
        now.day(),
        base
    );
    match suffix {
        Some(n) => dir.join(format!("{}.{}", stem, n)),
        None => dir.join(stem),
    }
}

fn open_append(path: &Path) -> RavelResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(RavelError::from)
}

impl LogSink {
    /// `path` names the log file; its final component becomes the base name
    /// that rotation keeps re-prefixing with the current date.
    pub fn open(path: &Path, rotate_lines: u64) -> RavelResult<LogSink> {
        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RavelError::Startup("log path has no file name".into()))?;
        let out = open_append(&dated_name(&dir, &base, None))?;
        Ok(LogSink {
            file: Mutex::new(LogFile {
                out,
                dir,
                base,
                day: Local::now().day(),
                count: 0,
            }),
            rotate_lines: rotate_lines.max(1),
        })
    }

    pub fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap();
        file.count += 1;
        let today = Local::now().day();
        if file.day != today {
            file.day = today;
            file.count = 0;
            if let Ok(out) = open_append(&dated_name(&file.dir, &file.base, None)) {
                file.out = out;
            }
        } else if file.count % self.rotate_lines == 0 {
            let index = file.count / self.rotate_lines;
            if let Ok(out) = open_append(&dated_name(&file.dir, &file.base, Some(index))) {
                file.out = out;
            }
        }
        let _ = file.out.write_all(line.as_bytes());
    }

    pub fn flush(&self) {
        let _ = self.file.lock().unwrap().out.flush();
    }
}

pub struct Logger {
    sink: Arc<LogSink>,
    queue: Option<Arc<BlockingQueue<String>>>,
}

impl Logger {
    /// Install the process logger. `queue_size > 0` selects async mode and
    /// spawns the drainer thread.
    pub fn init(path: &Path, rotate_lines: u64, queue_size: usize) -> RavelResult<()> {
        let sink = Arc::new(LogSink::open(path, rotate_lines)?);
        let queue = if queue_size > 0 {
            let queue = Arc::new(BlockingQueue::<String>::new(queue_size));
            let drain_queue = queue.clone();
            let drain_sink = sink.clone();
            thread::Builder::new()
                .name("ravel-log".to_string())
                .spawn(move || loop {
                    let line = drain_queue.pop();
                    drain_sink.write_line(&line);
                })
                .map_err(RavelError::from)?;
            Some(queue)
        } else {
            None
        };
        log::set_boxed_logger(Box::new(Logger { sink, queue }))
            .map_err(|e| RavelError::Startup(e.to_string()))?;
        log::set_max_level(LevelFilter::Debug);
        Ok(())
    }
}

fn level_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "error",
        log::Level::Warn => "warn",
        log::Level::Info => "info",
        _ => "debug",
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level_tag(record.level()),
            record.args()
        );
        match &self.queue {
            Some(queue) => {
                if !queue.push(line.clone()) {
                    self.sink.write_line(&line);
                }
            }
            None => self.sink.write_line(&line),
        }
    }

    fn flush(&self) {
        self.sink.flush();
    }
}
