//! Table definitions for the state store

use rusqlite::{Connection, Result as SqliteResult};

pub fn init(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS containers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            image TEXT NOT NULL,
            command TEXT NOT NULL,
            env TEXT NOT NULL DEFAULT '[]',
            labels TEXT NOT NULL DEFAULT '{}',
            restart_policy TEXT NOT NULL DEFAULT 'no',
            network_mode TEXT NOT NULL DEFAULT 'default',
            binds TEXT NOT NULL DEFAULT '[]',
            phase TEXT NOT NULL DEFAULT 'created',
            exit_code INTEGER,
            stopped_by_user INTEGER NOT NULL DEFAULT 0,
            restart_retry_count INTEGER NOT NULL DEFAULT 0,
            internal INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS networks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            driver TEXT NOT NULL,
            subnet TEXT NOT NULL,
            gateway TEXT NOT NULL,
            options TEXT NOT NULL DEFAULT '{}',
            labels TEXT NOT NULL DEFAULT '{}',
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS network_attachments (
            container_id TEXT NOT NULL,
            network_id TEXT NOT NULL,
            device_name TEXT NOT NULL,
            ipv4 TEXT NOT NULL,
            mac TEXT NOT NULL,
            host_vsock_port INTEGER,
            helper_vsock_port INTEGER,
            PRIMARY KEY (container_id, network_id)
        );

        CREATE TABLE IF NOT EXISTS subnet_allocation (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            next_octet INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO subnet_allocation (id, next_octet) VALUES (0, 18);

        CREATE INDEX IF NOT EXISTS idx_attachments_network
            ON network_attachments(network_id);
        "#,
    )
}
