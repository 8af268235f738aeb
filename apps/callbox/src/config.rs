use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::call::CandidatePolicy;
use crate::identity::generate_identity;
use crate::logging::{LogConfig, LogLevel};
use crate::media::MediaAccess;
use crate::signaling::ReconnectPolicy;

pub const DEFAULT_RELAY_PORT: u16 = 3001;
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Public STUN servers used when no ICE servers are configured.
pub const DEFAULT_ICE_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

#[derive(Parser, Debug, Clone)]
#[command(name = "callbox", about = "Peer-to-peer calls and chat through a callbox relay")]
pub struct ClientArgs {
    /// Relay WebSocket URL. Derived from --relay-host when unset.
    #[arg(long, env = "CALLBOX_RELAY_URL")]
    pub relay_url: Option<String>,

    #[arg(long, env = "CALLBOX_RELAY_HOST", default_value = "localhost")]
    pub relay_host: String,

    /// Identity to register. A random `adjective-noun-N` is used when unset.
    #[arg(long, env = "CALLBOX_USER_ID")]
    pub user_id: Option<String>,

    #[arg(long, env = "CALLBOX_RECONNECT_DELAY_SECS", default_value_t = DEFAULT_RECONNECT_DELAY_SECS)]
    pub reconnect_delay_secs: u64,

    /// Give up after this many failed reconnect attempts (unbounded when unset).
    #[arg(long, env = "CALLBOX_RECONNECT_MAX_ATTEMPTS")]
    pub reconnect_max_attempts: Option<u32>,

    #[arg(long, env = "CALLBOX_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    /// Hold candidates that arrive before the answer instead of dropping them.
    #[arg(long)]
    pub buffer_early_candidates: bool,

    /// Run without local capture; calls can be answered but not started.
    #[arg(long)]
    pub no_media: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, env = "CALLBOX_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid relay url {url:?}: {source}")]
    InvalidRelayUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("relay url must use ws:// or wss://, got {0}")]
    UnsupportedScheme(String),
    #[error("local identity cannot be empty")]
    EmptyIdentity,
}

/// Fully resolved client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: Url,
    pub identity: String,
    pub reconnect: ReconnectPolicy,
    pub ice_servers: Vec<String>,
    pub candidate_policy: CandidatePolicy,
    pub media: MediaAccess,
    pub log: LogConfig,
}

impl ClientConfig {
    pub fn from_args(args: &ClientArgs) -> Result<Self, ConfigError> {
        let raw_url = args
            .relay_url
            .clone()
            .unwrap_or_else(|| relay_url_for_host(&args.relay_host));
        let relay_url = parse_relay_url(&raw_url)?;

        let identity = match args.user_id.as_deref().map(str::trim) {
            Some("") => return Err(ConfigError::EmptyIdentity),
            Some(identity) => identity.to_string(),
            None => generate_identity(),
        };

        let reconnect = ReconnectPolicy {
            delay: Duration::from_secs(args.reconnect_delay_secs),
            max_attempts: args.reconnect_max_attempts,
        };

        let candidate_policy = if args.buffer_early_candidates {
            CandidatePolicy::BufferUntilAnswer
        } else {
            CandidatePolicy::Discard
        };

        let media = if args.no_media {
            MediaAccess::Denied("capture disabled with --no-media".into())
        } else {
            MediaAccess::Granted
        };

        Ok(Self {
            relay_url,
            identity,
            reconnect,
            ice_servers: ice_servers_or_default(&args.ice_servers),
            candidate_policy,
            media,
            log: LogConfig {
                level: args.log_level,
                file: args.log_file.clone(),
            },
        })
    }
}

/// Relay endpoint for a page served from `host`: the local development relay
/// for localhost, otherwise the `/api` path behind the same host over TLS.
pub fn relay_url_for_host(host: &str) -> String {
    let host = host.trim();
    if host.contains("localhost") {
        format!("ws://localhost:{DEFAULT_RELAY_PORT}")
    } else {
        format!("wss://{host}/api")
    }
}

fn parse_relay_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidRelayUrl {
        url: raw.to_string(),
        source,
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

fn ice_servers_or_default(configured: &[String]) -> Vec<String> {
    let servers: Vec<String> = configured
        .iter()
        .map(|server| server.trim())
        .filter(|server| !server.is_empty())
        .map(str::to_string)
        .collect();
    if servers.is_empty() {
        DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
    } else {
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> ClientArgs {
        let mut argv = vec!["callbox"];
        argv.extend_from_slice(extra);
        ClientArgs::try_parse_from(argv).expect("arguments parse")
    }

    #[test_timeout::timeout]
    fn relay_url_follows_host() {
        assert_eq!(relay_url_for_host("localhost"), "ws://localhost:3001");
        assert_eq!(relay_url_for_host("dev.localhost"), "ws://localhost:3001");
        assert_eq!(
            relay_url_for_host("calls.example.org"),
            "wss://calls.example.org/api"
        );
    }

    #[test_timeout::timeout]
    fn explicit_settings_win() {
        let config = ClientConfig::from_args(&args(&[
            "--relay-url",
            "ws://127.0.0.1:4000/api",
            "--user-id",
            "sun-star-3",
            "--reconnect-delay-secs",
            "1",
            "--reconnect-max-attempts",
            "3",
            "--ice-servers",
            "stun:a.example:3478, stun:b.example:3478",
            "--buffer-early-candidates",
        ]))
        .expect("config resolves");

        assert_eq!(config.relay_url.as_str(), "ws://127.0.0.1:4000/api");
        assert_eq!(config.identity, "sun-star-3");
        assert_eq!(config.reconnect.delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478", "stun:b.example:3478"]
        );
        assert_eq!(config.candidate_policy, CandidatePolicy::BufferUntilAnswer);
        assert!(config.media.is_granted());
    }

    #[test_timeout::timeout]
    fn defaults_cover_the_local_relay() {
        let config = ClientConfig::from_args(&args(&["--relay-host", "localhost"]))
            .expect("config resolves");
        assert_eq!(config.relay_url.as_str(), "ws://localhost:3001/");
        assert_eq!(config.ice_servers.len(), DEFAULT_ICE_SERVERS.len());
        assert_eq!(config.candidate_policy, CandidatePolicy::Discard);
        assert!(!config.identity.is_empty());
    }

    #[test_timeout::timeout]
    fn non_websocket_relay_is_rejected() {
        let result = ClientConfig::from_args(&args(&["--relay-url", "http://localhost:3001"]));
        assert!(matches!(result, Err(ConfigError::UnsupportedScheme(s)) if s == "http"));

        let result = ClientConfig::from_args(&args(&["--relay-url", "ws://x", "--user-id", " "]));
        assert!(matches!(result, Err(ConfigError::EmptyIdentity)));
    }
}
