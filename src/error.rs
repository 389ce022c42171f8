// src/error.rs
use std::io;
use thiserror::Error;

/// Central error type for the ravel server core.
#[derive(Debug, Error)]
pub enum RavelError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error from the relational store.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Fatal condition during startup (bind, listen, epoll, pool init).
    #[error("startup failed: {0}")]
    Startup(String),
}

pub type RavelResult<T> = Result<T, RavelError>;
