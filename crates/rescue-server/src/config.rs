use std::net::IpAddr;

/// Origin allowed by default: the local frontend dev server.
pub const DEFAULT_ORIGIN: &str = "http://localhost:5173";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// 0 picks a free port.
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub max_send_queue: usize,
    pub inbox_capacity: usize,
    pub relay_unknown_types: bool,
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 3000,
            allowed_origins: vec![DEFAULT_ORIGIN.to_string()],
            max_send_queue: 256,
            inbox_capacity: 1024,
            relay_unknown_types: true,
            environment: "development".into(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(port) = get("PORT") {
            config.port = parse("PORT", &port)?;
        }
        if let Some(bind) = get("BIND_ADDR") {
            config.bind = parse("BIND_ADDR", &bind)?;
        }
        if let Some(origin) = get("CLIENT_URL") {
            config = config.with_origin(origin);
        }
        if let Some(env) = get("NODE_ENV") {
            config.environment = env;
        }
        if let Some(flag) = get("RELAY_UNKNOWN_TYPES") {
            config.relay_unknown_types = parse_bool("RELAY_UNKNOWN_TYPES", &flag)?;
        }
        if let Some(queue) = get("WS_SEND_QUEUE") {
            let queue: usize = parse("WS_SEND_QUEUE", &queue)?;
            if queue == 0 {
                return Err(ConfigError::Invalid {
                    key: "WS_SEND_QUEUE",
                    value: "0".into(),
                });
            }
            config.max_send_queue = queue;
        }
        Ok(config)
    }

    /// Append an origin to the allow-list, ignoring duplicates.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        if !self.allowed_origins.contains(&origin) {
            self.allowed_origins.push(origin);
        }
        self
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}
