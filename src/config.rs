use std::path::PathBuf;

use crate::limits::MAX_BOOKINGS_PER_ROOM;

/// Per-tenant engine behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Mailbox that receives cancellation alerts.
    pub admin_email: String,
    /// Refuse to confirm a booking that overlaps an already confirmed one.
    pub confirm_guard: bool,
    pub max_bookings_per_room: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admin_email: "admin@localhost".into(),
            confirm_guard: true,
            max_bookings_per_room: MAX_BOOKINGS_PER_ROOM,
        }
    }
}

/// Process-level settings, read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roombook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            engine: EngineConfig::default(),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to the default and are logged.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> T {
            match lookup(key) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    tracing::warn!("ignoring invalid {key}={raw:?}");
                    default
                }),
                None => default,
            }
        }

        let confirm_guard = match lookup("ROOMBOOK_CONFIRM_GUARD") {
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                tracing::warn!("ignoring invalid ROOMBOOK_CONFIRM_GUARD={raw:?}");
                defaults.engine.confirm_guard
            }),
            None => defaults.engine.confirm_guard,
        };

        Self {
            port: parsed(&lookup, "ROOMBOOK_PORT", defaults.port),
            bind: lookup("ROOMBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("ROOMBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("ROOMBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "ROOMBOOK_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parsed(&lookup, "ROOMBOOK_COMPACT_THRESHOLD", defaults.compact_threshold),
            tls_cert: lookup("ROOMBOOK_TLS_CERT"),
            tls_key: lookup("ROOMBOOK_TLS_KEY"),
            metrics_port: lookup("ROOMBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            engine: EngineConfig {
                admin_email: lookup("ROOMBOOK_ADMIN_EMAIL").unwrap_or(defaults.engine.admin_email),
                confirm_guard,
                max_bookings_per_room: defaults.engine.max_bookings_per_room,
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
