//! Network and attachment persistence

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::StateStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub subnet: String,
    pub gateway: String,
    pub options: std::collections::HashMap<String, String>,
    pub labels: std::collections::HashMap<String, String>,
    pub is_default: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub container_id: String,
    pub network_id: String,
    pub device_name: String,
    pub ipv4: String,
    pub mac: String,
    pub host_vsock_port: Option<u32>,
    pub helper_vsock_port: Option<u32>,
}

fn row_to_network(row: &rusqlite::Row<'_>) -> rusqlite::Result<NetworkRecord> {
    let options_json: String = row.get("options")?;
    let labels_json: String = row.get("labels")?;
    Ok(NetworkRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        driver: row.get("driver")?,
        subnet: row.get("subnet")?,
        gateway: row.get("gateway")?,
        options: serde_json::from_str(&options_json).unwrap_or_default(),
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        is_default: row.get::<_, i64>("is_default")? != 0,
        created_at: row.get("created_at")?,
    })
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttachmentRecord> {
    Ok(AttachmentRecord {
        container_id: row.get("container_id")?,
        network_id: row.get("network_id")?,
        device_name: row.get("device_name")?,
        ipv4: row.get("ipv4")?,
        mac: row.get("mac")?,
        host_vsock_port: row.get::<_, Option<i64>>("host_vsock_port")?.map(|v| v as u32),
        helper_vsock_port: row.get::<_, Option<i64>>("helper_vsock_port")?.map(|v| v as u32),
    })
}

impl StateStore {
    pub async fn save_network(&self, record: &NetworkRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            r#"
            INSERT INTO networks (id, name, driver, subnet, gateway, options, labels, is_default, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, driver = excluded.driver, subnet = excluded.subnet,
                gateway = excluded.gateway, options = excluded.options, labels = excluded.labels,
                is_default = excluded.is_default
            "#,
            params![
                record.id,
                record.name,
                record.driver,
                record.subnet,
                record.gateway,
                serde_json::to_string(&record.options).unwrap_or_default(),
                serde_json::to_string(&record.labels).unwrap_or_default(),
                record.is_default as i64,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub async fn get_network(&self, id: &str) -> Result<Option<NetworkRecord>> {
        let conn = self.lock().await;
        Ok(conn
            .query_row("SELECT * FROM networks WHERE id = ?1", params![id], row_to_network)
            .optional()?)
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM networks ORDER BY created_at ASC")?;
        Ok(stmt.query_map([], row_to_network)?.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn delete_network(&self, id: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute("DELETE FROM networks WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub async fn save_attachment(&self, record: &AttachmentRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            r#"
            INSERT INTO network_attachments
                (container_id, network_id, device_name, ipv4, mac, host_vsock_port, helper_vsock_port)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.container_id,
                record.network_id,
                record.device_name,
                record.ipv4,
                record.mac,
                record.host_vsock_port,
                record.helper_vsock_port,
            ],
        )?;
        Ok(())
    }

    pub async fn delete_attachment(&self, container_id: &str, network_id: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "DELETE FROM network_attachments WHERE container_id = ?1 AND network_id = ?2",
            params![container_id, network_id],
        )?;
        Ok(())
    }

    pub async fn attachments_for_container(&self, container_id: &str) -> Result<Vec<AttachmentRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM network_attachments WHERE container_id = ?1",
        )?;
        Ok(stmt
            .query_map(params![container_id], row_to_attachment)?
            .collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn attachments_for_network(&self, network_id: &str) -> Result<Vec<AttachmentRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM network_attachments WHERE network_id = ?1",
        )?;
        Ok(stmt
            .query_map(params![network_id], row_to_attachment)?
            .collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn all_attachments(&self) -> Result<Vec<AttachmentRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM network_attachments")?;
        Ok(stmt.query_map([], row_to_attachment)?.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Third octets already in use by an existing `172.x.0.0/16` network.
    pub async fn used_subnet_octets(&self) -> Result<HashSet<u8>> {
        let conn = self.lock().await;
        used_subnet_octets_sync(&conn)
    }

    /// Atomically claim and advance the monotonic auto-subnet counter,
    /// skipping any octet already used by a persisted network.
    pub async fn allocate_subnet_octet(&self) -> Result<Option<u8>> {
        let conn = self.lock().await;
        let used = used_subnet_octets_sync(&conn)?;

        let mut next: i64 = conn.query_row(
            "SELECT next_octet FROM subnet_allocation WHERE id = 0",
            [],
            |row| row.get(0),
        )?;

        while next <= 31 {
            let candidate = next as u8;
            next += 1;
            if !used.contains(&candidate) {
                conn.execute(
                    "UPDATE subnet_allocation SET next_octet = ?1 WHERE id = 0",
                    params![next],
                )?;
                return Ok(Some(candidate));
            }
        }

        conn.execute(
            "UPDATE subnet_allocation SET next_octet = ?1 WHERE id = 0",
            params![next],
        )?;
        Ok(None)
    }
}

fn used_subnet_octets_sync(conn: &Connection) -> Result<HashSet<u8>> {
    let mut stmt = conn.prepare("SELECT subnet FROM networks WHERE subnet LIKE '172.%'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut used = HashSet::new();
    for subnet in rows {
        let subnet = subnet?;
        if let Some(octet) = parse_172_octet(&subnet) {
            used.insert(octet);
        }
    }
    Ok(used)
}

fn parse_172_octet(subnet: &str) -> Option<u8> {
    let mut parts = subnet.split('.');
    if parts.next()? != "172" {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_sequential_octets_skipping_used() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_network(&NetworkRecord {
                id: "n0".into(),
                name: "bridge".into(),
                driver: "overlay".into(),
                subnet: "172.17.0.0/16".into(),
                gateway: "172.17.0.1".into(),
                options: Default::default(),
                labels: Default::default(),
                is_default: true,
                created_at: 0,
            })
            .await
            .unwrap();

        let first = store.allocate_subnet_octet().await.unwrap().unwrap();
        assert_eq!(first, 18);
    }

    #[tokio::test]
    async fn skips_manually_used_octet() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_network(&NetworkRecord {
                id: "n1".into(),
                name: "custom".into(),
                driver: "overlay".into(),
                subnet: "172.18.0.0/16".into(),
                gateway: "172.18.0.1".into(),
                options: Default::default(),
                labels: Default::default(),
                is_default: false,
                created_at: 0,
            })
            .await
            .unwrap();

        let allocated = store.allocate_subnet_octet().await.unwrap().unwrap();
        assert_eq!(allocated, 19);
    }
}
