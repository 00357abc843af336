//! Shared API DTOs used by the control-plane daemon and the peer protocol.
//!
//! The same records double as persistence entities and wire payloads: the
//! coordinator pushes `Key` sets to peers verbatim and reads `PeerSettings`
//! out of a peer's settings response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Synthetic id of the node itself in server listings and metric maps.
pub const LOCAL_SERVER_ID: &str = "s-0";

/// Supported shadowsocks AEAD ciphers (wire format uses the engine names).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Cipher {
    /// chacha20-ietf-poly1305, the engine default.
    #[default]
    #[serde(rename = "chacha20-ietf-poly1305")]
    Chacha20IetfPoly1305,
    /// aes-128-gcm.
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    /// aes-256-gcm.
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl Cipher {
    /// Returns the canonical engine representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Cipher::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            Cipher::Aes128Gcm => "aes-128-gcm",
            Cipher::Aes256Gcm => "aes-256-gcm",
        }
    }
}

impl std::fmt::Display for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A per-user proxy access credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Key {
    /// Stable id `k-<n>`; monotonic, never reused.
    pub id: String,
    /// Opaque public identifier used in self-service links.
    #[serde(default)]
    pub code: String,
    /// Cipher the engine applies for this credential.
    pub cipher: Cipher,
    /// Connection secret; unique across all keys.
    pub secret: String,
    /// Display name.
    pub name: String,
    /// Usage ceiling in megabytes; 0 means unlimited.
    pub quota: u64,
    /// Whether the engine accepts this credential.
    pub enabled: bool,
}

impl Key {
    /// Field-level schema validation; uniqueness lives in the key table.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("key id is required".into());
        }
        if self.secret.len() < 6 || self.secret.len() > 64 {
            return Err(format!(
                "key {}: secret must be 6-64 characters",
                self.id
            ));
        }
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(format!("key {}: name must be 1-64 characters", self.id));
        }
        Ok(())
    }
}

/// Node-wide settings; a singleton per fleet node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Admin UI credential.
    pub admin_password: String,
    /// Bearer token peers and operators use against `/v1`.
    pub api_token: String,
    /// Whether this node runs its own shadowsocks engine.
    pub shadowsocks_enabled: bool,
    /// Advertised shadowsocks host.
    pub shadowsocks_host: String,
    /// Advertised shadowsocks port; the fleet-wide engine listen port.
    pub shadowsocks_port: u16,
    /// Optional externally reachable HTTPS base URL.
    #[serde(default)]
    pub external_https: String,
    /// Externally reachable HTTP base URL.
    pub external_http: String,
    /// Traffic-accounting multiplier applied to reported usage; >= 1.
    pub traffic_ratio: f64,
}

impl Settings {
    /// Schema validation for the settings document.
    pub fn validate(&self) -> Result<(), String> {
        if self.admin_password.len() < 8 || self.admin_password.len() > 32 {
            return Err("admin_password must be 8-32 characters".into());
        }
        if self.api_token.len() < 16 || self.api_token.len() > 128 {
            return Err("api_token must be 16-128 characters".into());
        }
        if self.shadowsocks_host.is_empty() || self.shadowsocks_host.len() > 128 {
            return Err("shadowsocks_host must be 1-128 characters".into());
        }
        if self.shadowsocks_port == 0 {
            return Err("shadowsocks_port must be 1-65535".into());
        }
        if self.external_http.is_empty() {
            return Err("external_http is required".into());
        }
        if self.traffic_ratio < 1.0 {
            return Err("traffic_ratio must be >= 1".into());
        }
        Ok(())
    }
}

/// The slice of a peer's settings the pull protocol copies home.
///
/// Deserialized from the peer's full settings response; unknown fields are
/// ignored so peers on newer builds stay readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSettings {
    /// Whether the peer runs its own engine.
    pub shadowsocks_enabled: bool,
    /// The peer's advertised shadowsocks host.
    pub shadowsocks_host: String,
    /// The peer's advertised shadowsocks port.
    pub shadowsocks_port: u16,
}

/// Peer health classification (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Just created; no pull or push has completed yet.
    #[default]
    Processing,
    /// The most recent pull or push succeeded.
    Active,
    /// The peer rejected our bearer token (401).
    Unauthorized,
    /// The peer was unreachable or answered with an unexpected status.
    Unavailable,
}

/// Outcome of a single pull or push attempt against a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    /// The peer answered as expected.
    Synced,
    /// The peer answered 401.
    Denied,
    /// Transport failure or unexpected status.
    Unreachable,
}

impl ServerStatus {
    /// The status state machine: the latest attempt's outcome wins,
    /// regardless of the previous state.
    pub fn from_outcome(outcome: PeerOutcome) -> Self {
        match outcome {
            PeerOutcome::Synced => ServerStatus::Active,
            PeerOutcome::Denied => ServerStatus::Unauthorized,
            PeerOutcome::Unreachable => ServerStatus::Unavailable,
        }
    }

    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Processing => "processing",
            ServerStatus::Active => "active",
            ServerStatus::Unauthorized => "unauthorized",
            ServerStatus::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A peer fleet node tracked by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    /// Stable id `s-<n>`; monotonic, never reused.
    pub id: String,
    /// Management API host.
    pub http_host: String,
    /// Management API port.
    pub http_port: u16,
    /// Bearer token used to authenticate against the peer.
    pub api_token: String,
    /// Peer-reported engine enablement; populated by pulls only.
    #[serde(default)]
    pub shadowsocks_enabled: bool,
    /// Peer-reported engine host; populated by pulls only.
    #[serde(default)]
    pub shadowsocks_host: String,
    /// Peer-reported engine port; populated by pulls only.
    #[serde(default)]
    pub shadowsocks_port: u16,
    /// Latest pull/push health classification.
    #[serde(default)]
    pub status: ServerStatus,
    /// Timestamp of the last successful key push.
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Server {
    /// Field-level schema validation.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("server id is required".into());
        }
        if self.http_host.is_empty() {
            return Err(format!("server {}: http_host is required", self.id));
        }
        if self.http_port == 0 {
            return Err(format!("server {}: http_port must be 1-65535", self.id));
        }
        Ok(())
    }
}

/// Byte counters aggregated over the rolling metrics window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficTotals {
    /// Client-bound TCP bytes.
    pub down_tcp: u64,
    /// Proxy-bound TCP bytes.
    pub up_tcp: u64,
    /// Client-bound UDP bytes.
    pub down_udp: u64,
    /// Proxy-bound UDP bytes.
    pub up_udp: u64,
    /// Sum over all directions and protocols.
    pub total: u64,
}

/// Request body for creating a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreKeyRequest {
    /// Cipher for the new credential.
    pub cipher: Cipher,
    /// Connection secret.
    pub secret: String,
    /// Display name.
    pub name: String,
    /// Quota in megabytes; 0 means unlimited.
    pub quota: u64,
    /// Initial enablement.
    pub enabled: bool,
}

/// Request body for updating a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateKeyRequest {
    /// Id of the key to update.
    pub id: String,
    /// Remaining mutable fields.
    #[serde(flatten)]
    pub fields: StoreKeyRequest,
}

/// A key as rendered to operators, with usage attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyView {
    /// The stored key.
    #[serde(flatten)]
    pub key: Key,
    /// Megabytes used within the metrics window, scaled by traffic_ratio.
    pub used: u64,
}

/// Request body for registering a peer server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreServerRequest {
    /// Management API host.
    pub http_host: String,
    /// Management API port.
    pub http_port: u16,
    /// Bearer token for the peer.
    pub api_token: String,
}

/// Request body for updating a peer server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateServerRequest {
    /// Id of the server to update.
    pub id: String,
    /// Remaining operator-settable fields.
    #[serde(flatten)]
    pub fields: StoreServerRequest,
}

/// A server as rendered to operators, with usage attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerView {
    /// The stored (or synthetic local) server record.
    #[serde(flatten)]
    pub server: Server,
    /// Megabytes relayed within the metrics window, scaled by traffic_ratio.
    pub used: u64,
}

/// Settings as rendered over the management API.
///
/// Peers deserialize [`PeerSettings`] out of this body during pulls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsView {
    /// The full settings document.
    #[serde(flatten)]
    pub settings: Settings,
    /// The node's management API port.
    pub http_port: u16,
}
