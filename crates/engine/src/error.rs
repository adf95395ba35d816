use sstable::RunError;
use std::io;
use thiserror::Error;
use wal::{Canceled, LogError};

use crate::replication::TransportError;

/// Condition reported to callers. Every [`Error`] maps to exactly one code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoSuchDb,
    DbExists,
    NoSuchIndex,
    NoSuchSnapshot,
    SnapshotExists,
    InvalidArgument,
    IoError,
    ReplicationFailure,
    InternalError,
    Busy,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database '{0}' does not exist")]
    NoSuchDb(String),

    #[error("database '{0}' already exists")]
    DbExists(String),

    #[error("index {index} does not exist in database '{db}'")]
    NoSuchIndex { db: String, index: usize },

    #[error("snapshot '{snapshot}' of database '{db}' does not exist")]
    NoSuchSnapshot { db: String, snapshot: String },

    #[error("snapshot '{snapshot}' of database '{db}' already exists")]
    SnapshotExists { db: String, snapshot: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("run error: {0}")]
    Run(#[from] RunError),

    #[error("corrupted data: {0}")]
    Corruption(String),

    #[error("replication failure: {0}")]
    Replication(String),

    #[error("replication transport: {0}")]
    Transport(#[from] TransportError),

    #[error("request queue of worker {0} is full")]
    Busy(usize),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoSuchDb(_) => ErrorCode::NoSuchDb,
            Error::DbExists(_) => ErrorCode::DbExists,
            Error::NoSuchIndex { .. } => ErrorCode::NoSuchIndex,
            Error::NoSuchSnapshot { .. } => ErrorCode::NoSuchSnapshot,
            Error::SnapshotExists { .. } => ErrorCode::SnapshotExists,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::Io(_) | Error::Run(_) | Error::Corruption(_) => ErrorCode::IoError,
            Error::Log(LogError::Abandoned) => ErrorCode::InternalError,
            Error::Log(_) => ErrorCode::IoError,
            Error::Replication(_) | Error::Transport(_) => ErrorCode::ReplicationFailure,
            Error::Busy(_) => ErrorCode::Busy,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub(crate) fn no_such_db_id(id: u32) -> Self {
        Error::NoSuchDb(format!("#{}", id))
    }
}

impl From<Canceled> for Error {
    fn from(_: Canceled) -> Self {
        Error::Internal("operation abandoned before completion".into())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
