//! In-memory container types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::{ContainerRecord, RestartPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Created,
    Running,
    Exited,
    Removing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Running => "running",
            Phase::Exited => "exited",
            Phase::Removing => "removing",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Phase::Running,
            "exited" => Phase::Exited,
            "removing" => Phase::Removing,
            _ => Phase::Created,
        }
    }
}

/// Who is asking: gates reserved-container mutation (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    User,
    Reconciler,
}

/// Host configuration supplied at create time.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub restart_policy: RestartPolicy,
    pub network_mode: String,
    pub binds: Vec<String>,
}

/// Input DTO to `ContainerManager::create`.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub host: HostConfig,
    pub internal: bool,
}

/// A fully materialized in-memory container record, mirroring the
/// persisted row plus whatever the manager needs to answer queries
/// without touching the store.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub restart_policy: RestartPolicy,
    pub network_mode: String,
    pub binds: Vec<String>,
    pub phase: Phase,
    pub exit_code: Option<i32>,
    pub stopped_by_user: bool,
    pub restart_retry_count: i64,
    pub internal: bool,
    pub created_at: i64,
}

impl Container {
    pub fn is_reserved(&self) -> bool {
        self.internal
    }

    pub fn short_id(&self) -> &str {
        crate::id::IDRegistry::short_id(&self.id)
    }

    pub fn to_record(&self) -> ContainerRecord {
        ContainerRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            command: self.command.clone(),
            env: self.env.clone(),
            labels: self.labels.clone(),
            restart_policy: self.restart_policy,
            network_mode: self.network_mode.clone(),
            binds: self.binds.clone(),
            phase: self.phase.as_str().to_string(),
            exit_code: self.exit_code,
            stopped_by_user: self.stopped_by_user,
            restart_retry_count: self.restart_retry_count,
            internal: self.internal,
            created_at: self.created_at,
        }
    }

    pub fn from_record(record: ContainerRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            image: record.image,
            command: record.command,
            env: record.env,
            labels: record.labels,
            restart_policy: record.restart_policy,
            network_mode: record.network_mode,
            binds: record.binds,
            phase: Phase::parse(&record.phase),
            exit_code: record.exit_code,
            stopped_by_user: record.stopped_by_user,
            restart_retry_count: record.restart_retry_count,
            internal: record.internal,
            created_at: record.created_at,
        }
    }
}
