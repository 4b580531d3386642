//! Container persistence

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure => "on-failure",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "always" => RestartPolicy::Always,
            "unless-stopped" => RestartPolicy::UnlessStopped,
            "on-failure" => RestartPolicy::OnFailure,
            _ => RestartPolicy::No,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub labels: std::collections::HashMap<String, String>,
    pub restart_policy: RestartPolicy,
    pub network_mode: String,
    pub binds: Vec<String>,
    pub phase: String,
    pub exit_code: Option<i32>,
    pub stopped_by_user: bool,
    pub restart_retry_count: i64,
    pub internal: bool,
    pub created_at: i64,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContainerRecord> {
    let command_json: String = row.get("command")?;
    let env_json: String = row.get("env")?;
    let labels_json: String = row.get("labels")?;
    let binds_json: String = row.get("binds")?;

    Ok(ContainerRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        image: row.get("image")?,
        command: serde_json::from_str(&command_json).unwrap_or_default(),
        env: serde_json::from_str(&env_json).unwrap_or_default(),
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        restart_policy: RestartPolicy::parse(&row.get::<_, String>("restart_policy")?),
        network_mode: row.get("network_mode")?,
        binds: serde_json::from_str(&binds_json).unwrap_or_default(),
        phase: row.get("phase")?,
        exit_code: row.get("exit_code")?,
        stopped_by_user: row.get::<_, i64>("stopped_by_user")? != 0,
        restart_retry_count: row.get("restart_retry_count")?,
        internal: row.get::<_, i64>("internal")? != 0,
        created_at: row.get("created_at")?,
    })
}

impl StateStore {
    pub async fn save_container(&self, record: &ContainerRecord) -> Result<()> {
        let conn = self.lock().await;
        save_container_sync(&conn, record)?;
        Ok(())
    }

    pub async fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.lock().await;
        Ok(get_container_sync(&conn, id)?)
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let conn = self.lock().await;
        Ok(list_containers_sync(&conn)?)
    }

    pub async fn delete_container(&self, id: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        conn.execute(
            "DELETE FROM network_attachments WHERE container_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub async fn set_exit_state(
        &self,
        id: &str,
        phase: &str,
        exit_code: Option<i32>,
        stopped_by_user: bool,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE containers SET phase = ?1, exit_code = ?2, stopped_by_user = ?3 WHERE id = ?4",
            params![phase, exit_code, stopped_by_user as i64, id],
        )?;
        Ok(())
    }

    pub async fn set_phase(&self, id: &str, phase: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE containers SET phase = ?1 WHERE id = ?2",
            params![phase, id],
        )?;
        Ok(())
    }

    pub async fn bump_restart_retry(&self, id: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE containers SET restart_retry_count = restart_retry_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Rows eligible for restart-policy application, per §4.7/§8.
    pub async fn containers_to_restart(&self, max_on_failure_retries: i64) -> Result<Vec<ContainerRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM containers
            WHERE phase = 'exited' AND (
                restart_policy = 'always'
                OR (restart_policy = 'unless-stopped' AND stopped_by_user = 0)
                OR (restart_policy = 'on-failure' AND exit_code != 0 AND restart_retry_count < ?1)
            )
            "#,
        )?;
        let rows = stmt
            .query_map(params![max_on_failure_retries], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn save_container_sync(conn: &Connection, record: &ContainerRecord) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO containers
            (id, name, image, command, env, labels, restart_policy, network_mode, binds,
             phase, exit_code, stopped_by_user, restart_retry_count, internal, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            image = excluded.image,
            command = excluded.command,
            env = excluded.env,
            labels = excluded.labels,
            restart_policy = excluded.restart_policy,
            network_mode = excluded.network_mode,
            binds = excluded.binds,
            phase = excluded.phase,
            exit_code = excluded.exit_code,
            stopped_by_user = excluded.stopped_by_user,
            restart_retry_count = excluded.restart_retry_count,
            internal = excluded.internal
        "#,
        params![
            record.id,
            record.name,
            record.image,
            serde_json::to_string(&record.command).unwrap_or_default(),
            serde_json::to_string(&record.env).unwrap_or_default(),
            serde_json::to_string(&record.labels).unwrap_or_default(),
            record.restart_policy.as_str(),
            record.network_mode,
            serde_json::to_string(&record.binds).unwrap_or_default(),
            record.phase,
            record.exit_code,
            record.stopped_by_user as i64,
            record.restart_retry_count,
            record.internal as i64,
            record.created_at,
        ],
    )?;
    Ok(())
}

fn get_container_sync(conn: &Connection, id: &str) -> rusqlite::Result<Option<ContainerRecord>> {
    conn.query_row("SELECT * FROM containers WHERE id = ?1", params![id], row_to_record)
        .optional()
}

fn list_containers_sync(conn: &Connection) -> rusqlite::Result<Vec<ContainerRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM containers ORDER BY created_at ASC")?;
    stmt.query_map([], row_to_record)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;

    fn sample(id: &str, name: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: name.to_string(),
            image: "alpine:latest".to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            env: vec![],
            labels: Default::default(),
            restart_policy: RestartPolicy::No,
            network_mode: "default".to_string(),
            binds: vec![],
            phase: "created".to_string(),
            exit_code: None,
            stopped_by_user: false,
            restart_retry_count: 0,
            internal: false,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn round_trips_a_container() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = sample(&"a".repeat(64), "web");
        store.save_container(&rec).await.unwrap();

        let loaded = store.get_container(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.command, vec!["echo", "hi"]);

        store.delete_container(&rec.id).await.unwrap();
        assert!(store.get_container(&rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restart_policy_always_selected_when_exited() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rec = sample(&"b".repeat(64), "svc");
        rec.restart_policy = RestartPolicy::Always;
        rec.phase = "exited".to_string();
        store.save_container(&rec).await.unwrap();

        let candidates = store.containers_to_restart(10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, rec.id);
    }

    #[tokio::test]
    async fn unless_stopped_skips_user_stopped_containers() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rec = sample(&"c".repeat(64), "svc2");
        rec.restart_policy = RestartPolicy::UnlessStopped;
        rec.phase = "exited".to_string();
        rec.stopped_by_user = true;
        store.save_container(&rec).await.unwrap();

        let candidates = store.containers_to_restart(10).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn on_failure_respects_retry_cap() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rec = sample(&"d".repeat(64), "svc3");
        rec.restart_policy = RestartPolicy::OnFailure;
        rec.phase = "exited".to_string();
        rec.exit_code = Some(1);
        rec.restart_retry_count = 10;
        store.save_container(&rec).await.unwrap();

        let candidates = store.containers_to_restart(10).await.unwrap();
        assert!(candidates.is_empty());
    }
}
