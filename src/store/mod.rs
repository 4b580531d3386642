//! Durable relational store
//!
//! A single SQLite database (WAL journal mode) holding containers,
//! networks, network attachments, and the subnet-allocation counter.
//! The exit-code write-ahead log is a separate append-only file; see
//! [`exit_wal`].

mod containers;
mod exit_wal;
mod networks;
mod schema;

pub use containers::{ContainerRecord, RestartPolicy};
pub use exit_wal::{ExitWalRecord, ExitWal};
pub use networks::{AttachmentRecord, NetworkRecord};

use std::path::Path;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;

/// The daemon's single embedded relational store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        schema::init(&conn)?;

        info!(path = %path.display(), "state store opened");

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
