// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool reads its own sizing variables (see db::pool).

use std::net::SocketAddr;
use std::time::Duration;

use picsync_common::types::PictureId;

pub(crate) const DEV_JWT_SECRET: &str = "picsync_local_development_jwt_secret_must_be_32_chars";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
const DEFAULT_SLOW_CONSUMER_DROP_LIMIT: usize = 64;
const DEFAULT_MAX_PROTOCOL_VIOLATIONS: u32 = 10;
const DEFAULT_MAX_FRAME_BYTES: usize = 65_536;
const DEFAULT_MAX_EDIT_PAYLOAD_BYTES: usize = 16_384;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with the identity provider.
    pub jwt_secret: String,
    /// PostgreSQL connection string for picture access checks. When absent the
    /// relay falls back to an in-memory access store.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `picsync_relay=debug`).
    pub log_filter: String,
    /// Public pictures seeded into the in-memory access store. Ignored when a
    /// database is configured.
    pub dev_public_pictures: Vec<PictureId>,
    pub collab: CollabConfig,
}

/// Tunables for the editing rooms and their connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabConfig {
    pub heartbeat_interval: Duration,
    /// How long a probe may go unanswered. Always shorter than the interval.
    pub heartbeat_timeout: Duration,
    pub outbound_queue_capacity: usize,
    /// Consecutive drop-oldest evictions tolerated before a client is cut off.
    pub slow_consumer_drop_limit: usize,
    pub max_protocol_violations: u32,
    pub max_frame_bytes: usize,
    pub max_edit_payload_bytes: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            slow_consumer_drop_limit: DEFAULT_SLOW_CONSUMER_DROP_LIMIT,
            max_protocol_violations: DEFAULT_MAX_PROTOCOL_VIOLATIONS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_edit_payload_bytes: DEFAULT_MAX_EDIT_PAYLOAD_BYTES,
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PICSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `PICSYNC_RELAY_PORT` | `8080` |
    /// | `PICSYNC_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `PICSYNC_RELAY_DATABASE_URL` | *(none, in-memory access store)* |
    /// | `PICSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `PICSYNC_RELAY_DEV_PUBLIC_PICTURES` | *(none)*, comma-separated ids |
    /// | `PICSYNC_RELAY_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `PICSYNC_RELAY_HEARTBEAT_TIMEOUT_MS` | `10000` |
    /// | `PICSYNC_RELAY_OUTBOUND_QUEUE_CAPACITY` | `256` |
    /// | `PICSYNC_RELAY_SLOW_CONSUMER_DROP_LIMIT` | `64` |
    /// | `PICSYNC_RELAY_MAX_PROTOCOL_VIOLATIONS` | `10` |
    /// | `PICSYNC_RELAY_MAX_FRAME_BYTES` | `65536` |
    /// | `PICSYNC_RELAY_MAX_EDIT_PAYLOAD_BYTES` | `16384` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PICSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = parse_or(&env, "PICSYNC_RELAY_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("PICSYNC_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("PICSYNC_RELAY_DATABASE_URL").ok().filter(|url| !url.is_empty());
        let log_filter = env("PICSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let dev_public_pictures = env("PICSYNC_RELAY_DEV_PUBLIC_PICTURES")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|id| id.trim().parse::<PictureId>().ok())
                    .filter(|id| *id > 0)
                    .collect()
            })
            .unwrap_or_default();

        let heartbeat_interval_ms = parse_or(
            &env,
            "PICSYNC_RELAY_HEARTBEAT_INTERVAL_MS",
            DEFAULT_HEARTBEAT_INTERVAL_MS,
        )
        .max(1);
        let heartbeat_timeout_ms =
            parse_or(&env, "PICSYNC_RELAY_HEARTBEAT_TIMEOUT_MS", DEFAULT_HEARTBEAT_TIMEOUT_MS);
        // A timeout at or past the interval would expire healthy clients
        // before their next probe is even sent.
        let heartbeat_timeout_ms = if heartbeat_timeout_ms >= heartbeat_interval_ms {
            heartbeat_interval_ms.saturating_sub(heartbeat_interval_ms / 3).max(1)
        } else {
            heartbeat_timeout_ms.max(1)
        };

        let collab = CollabConfig {
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
            outbound_queue_capacity: parse_or(
                &env,
                "PICSYNC_RELAY_OUTBOUND_QUEUE_CAPACITY",
                DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            )
            .max(1),
            slow_consumer_drop_limit: parse_or(
                &env,
                "PICSYNC_RELAY_SLOW_CONSUMER_DROP_LIMIT",
                DEFAULT_SLOW_CONSUMER_DROP_LIMIT,
            ),
            max_protocol_violations: parse_or(
                &env,
                "PICSYNC_RELAY_MAX_PROTOCOL_VIOLATIONS",
                DEFAULT_MAX_PROTOCOL_VIOLATIONS,
            )
            .max(1),
            max_frame_bytes: parse_or(
                &env,
                "PICSYNC_RELAY_MAX_FRAME_BYTES",
                DEFAULT_MAX_FRAME_BYTES,
            ),
            max_edit_payload_bytes: parse_or(
                &env,
                "PICSYNC_RELAY_MAX_EDIT_PAYLOAD_BYTES",
                DEFAULT_MAX_EDIT_PAYLOAD_BYTES,
            ),
        };

        Self { listen_addr, jwt_secret, database_url, log_filter, dev_public_pictures, collab }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}
