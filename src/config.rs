// src/config.rs
use std::env;
use std::path::PathBuf;

use clap::Parser;

/// Level- vs edge-triggered readiness for one epoll registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Level,
    Edge,
}

/// Who performs socket I/O: the reactor thread (proactor) or the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorModel {
    Proactor,
    Reactor,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "ravel", about = "Multi-threaded epoll HTTP/1.1 server")]
pub struct Config {
    /// Listen port
    #[arg(short = 'p', default_value_t = 9006)]
    pub port: u16,

    /// Log mode: 0 = synchronous writes, 1 = background queue
    #[arg(short = 'l', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub log_async: u8,

    /// Trigger combination: 0 = LT+LT, 1 = LT+ET, 2 = ET+LT, 3 = ET+ET
    #[arg(short = 'm', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub trig_mode: u8,

    /// SO_LINGER on sockets: 0 = off, 1 = on
    #[arg(short = 'o', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub opt_linger: u8,

    /// Database connection pool size
    #[arg(short = 's', default_value_t = 8)]
    pub db_pool_size: usize,

    /// Worker thread count
    #[arg(short = 't', default_value_t = 8)]
    pub workers: usize,

    /// 1 disables logging entirely
    #[arg(short = 'c', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub log_off: u8,

    /// Concurrency model: 0 = proactor, 1 = reactor
    #[arg(short = 'a', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub actor_model: u8,
}

impl Config {
    pub fn listen_trigger(&self) -> TriggerMode {
        match self.trig_mode {
            2 | 3 => TriggerMode::Edge,
            _ => TriggerMode::Level,
        }
    }

    pub fn conn_trigger(&self) -> TriggerMode {
        match self.trig_mode {
            1 | 3 => TriggerMode::Edge,
            _ => TriggerMode::Level,
        }
    }

    pub fn actor(&self) -> ActorModel {
        if self.actor_model == 1 {
            ActorModel::Reactor
        } else {
            ActorModel::Proactor
        }
    }

    pub fn linger(&self) -> bool {
        self.opt_linger == 1
    }

    /// Site root: `<cwd>/resources/webroot`.
    pub fn webroot(&self) -> PathBuf {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("resources")
            .join("webroot")
    }

    /// SQLite database file, under `<cwd>/data`.
    pub fn database_path(&self) -> PathBuf {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("data")
            .join("ravel.db")
    }

    /// Base log file name; the sink prefixes it with the current date.
    pub fn log_path(&self) -> PathBuf {
        PathBuf::from("./ravel.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::try_parse_from(["ravel"]).unwrap();
        assert_eq!(cfg.port, 9006);
        assert_eq!(cfg.log_async, 0);
        assert_eq!(cfg.trig_mode, 0);
        assert_eq!(cfg.opt_linger, 0);
        assert_eq!(cfg.db_pool_size, 8);
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.log_off, 0);
        assert_eq!(cfg.actor_model, 0);
        assert_eq!(cfg.listen_trigger(), TriggerMode::Level);
        assert_eq!(cfg.conn_trigger(), TriggerMode::Level);
        assert_eq!(cfg.actor(), ActorModel::Proactor);
    }

    #[test]
    fn trigger_matrix_splits_listen_and_conn() {
        let cases = [
            (0, TriggerMode::Level, TriggerMode::Level),
            (1, TriggerMode::Level, TriggerMode::Edge),
            (2, TriggerMode::Edge, TriggerMode::Level),
            (3, TriggerMode::Edge, TriggerMode::Edge),
        ];
        for (mode, listen, conn) in cases {
            let arg = mode.to_string();
            let cfg = Config::try_parse_from(["ravel", "-m", arg.as_str()]).unwrap();
            assert_eq!(cfg.listen_trigger(), listen, "mode {}", mode);
            assert_eq!(cfg.conn_trigger(), conn, "mode {}", mode);
        }
    }

    #[test]
    fn rejects_out_of_range_mode() {
        assert!(Config::try_parse_from(["ravel", "-m", "4"]).is_err());
        assert!(Config::try_parse_from(["ravel", "-a", "2"]).is_err());
    }

    #[test]
    fn parses_full_flag_set() {
        let cfg = Config::try_parse_from([
            "ravel", "-p", "8080", "-l", "1", "-m", "3", "-o", "1", "-s", "4", "-t", "2",
            "-c", "1", "-a", "1",
        ])
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.log_async, 1);
        assert_eq!(cfg.actor(), ActorModel::Reactor);
        assert_eq!(cfg.conn_trigger(), TriggerMode::Edge);
        assert!(cfg.linger());
        assert_eq!(cfg.db_pool_size, 4);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.log_off, 1);
    }
}
