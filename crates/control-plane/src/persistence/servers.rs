use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::api::{Server, ServerStatus};

use super::{DataError, Document};

/// Operator-settable fields of a new peer server. The engine fields and the
/// health status are owned by the reconciliation protocols.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub http_host: String,
    pub http_port: u16,
    pub api_token: String,
}

/// The durable peer collection. Ids are `s-<n>`, monotonic, never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTable {
    pub servers: Vec<Server>,
    pub next_id: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ServerTable {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            next_id: 1,
            updated_at: None,
        }
    }
}

impl Document for ServerTable {
    const FILE: &'static str = "servers.json";

    fn validate(&self) -> Result<(), DataError> {
        if self.next_id < 1 {
            return Err(DataError::validation("next_id must be >= 1"));
        }
        let mut ids = HashSet::new();
        for server in &self.servers {
            server.validate().map_err(DataError::validation)?;
            if !ids.insert(server.id.as_str()) {
                return Err(DataError::validation(format!(
                    "duplicate server id {}",
                    server.id
                )));
            }
        }
        Ok(())
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

impl ServerTable {
    pub fn find(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Append a new peer in `Processing` status with zeroed engine fields;
    /// only a successful pull fills those in.
    pub fn store(&mut self, new: NewServer) -> Result<Server, DataError> {
        let server = Server {
            id: format!("s-{}", self.next_id),
            http_host: new.http_host,
            http_port: new.http_port,
            api_token: new.api_token,
            shadowsocks_enabled: false,
            shadowsocks_host: String::new(),
            shadowsocks_port: 0,
            status: ServerStatus::Processing,
            synced_at: None,
        };
        server.validate().map_err(DataError::validation)?;

        self.next_id += 1;
        self.servers.push(server.clone());
        Ok(server)
    }

    /// Replace the mutable fields of an existing peer; `None` when the id is
    /// unknown.
    pub fn update(&mut self, server: Server) -> Result<Option<Server>, DataError> {
        let Some(stored) = self.servers.iter_mut().find(|s| s.id == server.id) else {
            return Ok(None);
        };

        let candidate = Server {
            id: stored.id.clone(),
            ..server
        };
        candidate.validate().map_err(DataError::validation)?;

        *stored = candidate.clone();
        Ok(Some(candidate))
    }

    /// Remove a peer; `false` when the id is unknown. The id is never reused.
    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.id != id);
        self.servers.len() != before
    }
}
