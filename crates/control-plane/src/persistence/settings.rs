use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::api::Settings;

use super::{DataError, Document};

/// Placeholder values written into a fresh settings document. The
/// coordinator's one-time bootstrap replaces each of them with a generated
/// secret, a discovered free port, and a URL derived from the HTTP listener.
pub const PLACEHOLDER_API_TOKEN: &str = "api-token-secret-1";
pub const PLACEHOLDER_ADMIN_PASSWORD: &str = "password";
pub const PLACEHOLDER_EXTERNAL_HTTP: &str = "http://localhost";
pub const PLACEHOLDER_SHADOWSOCKS_PORT: u16 = 1;

/// The singleton settings document. Never deleted, only overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingTable {
    #[serde(flatten)]
    pub settings: Settings,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for SettingTable {
    fn default() -> Self {
        Self {
            settings: Settings {
                admin_password: PLACEHOLDER_ADMIN_PASSWORD.into(),
                api_token: PLACEHOLDER_API_TOKEN.into(),
                shadowsocks_enabled: true,
                shadowsocks_host: "127.0.0.1".into(),
                shadowsocks_port: PLACEHOLDER_SHADOWSOCKS_PORT,
                external_https: String::new(),
                external_http: PLACEHOLDER_EXTERNAL_HTTP.into(),
                traffic_ratio: 1.0,
            },
            updated_at: None,
        }
    }
}

impl Document for SettingTable {
    const FILE: &'static str = "settings.json";

    fn validate(&self) -> Result<(), DataError> {
        self.settings.validate().map_err(DataError::validation)
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_pass_validation() {
        let table = SettingTable::default();
        assert!(table.validate().is_ok());
        assert_eq!(table.settings.api_token, PLACEHOLDER_API_TOKEN);
        assert_eq!(table.settings.shadowsocks_port, PLACEHOLDER_SHADOWSOCKS_PORT);
    }

    #[test]
    fn document_round_trips_with_timestamp() {
        let mut table = SettingTable::default();
        table.stamp(Utc::now());

        let raw = serde_json::to_vec(&table).expect("serialize");
        let back: SettingTable = serde_json::from_slice(&raw).expect("deserialize");
        assert_eq!(back.settings, table.settings);
        assert_eq!(back.updated_at, table.updated_at);
    }
}
