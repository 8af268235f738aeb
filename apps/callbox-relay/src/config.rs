use std::env;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind_host: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: parse_port(env::var("PORT").ok().as_deref()),
            bind_host: env::var("CALLBOX_BIND_HOST")
                .ok()
                .filter(|host| !host.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_host: DEFAULT_BIND_HOST.to_string(),
        }
    }
}

/// Unset or unparsable values fall back to [`DEFAULT_PORT`].
fn parse_port(value: Option<&str>) -> u16 {
    value
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn port_defaults_when_unset_or_invalid() {
        assert_eq!(parse_port(None), 3001);
        assert_eq!(parse_port(Some("not-a-port")), 3001);
        assert_eq!(parse_port(Some(" 8080 ")), 8080);
    }

    #[test_timeout::timeout]
    fn cli_port_overrides_environment() {
        let config = Config::default().with_port(Some(9000));
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(Config::default().with_port(None).port, DEFAULT_PORT);
    }
}
