// Client options: connection-default headers and dispatch knobs.
use crate::{ClientError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use tether_wire::Headers;

pub(crate) const DEFAULT_REPLY_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection-default headers merged under per-call headers.
    pub headers: Option<Headers>,
    /// Log ping-timeout status updates; they are noise on idle links.
    pub debug: bool,
    /// Buffered reply frames per in-flight request.
    pub reply_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            headers: None,
            debug: false,
            reply_queue_depth: DEFAULT_REPLY_QUEUE_DEPTH,
        }
    }
}

// Optional override file; zero values are ignored so a partial file cannot
// disable dispatch.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    headers: Option<BTreeMap<String, String>>,
    debug: Option<bool>,
    reply_queue_depth: Option<usize>,
}

impl ClientConfigOverride {
    fn apply(self, config: &mut ClientConfig) {
        if let Some(headers) = self.headers {
            config.headers = Some(headers.into_iter().collect());
        }
        if let Some(debug) = self.debug {
            config.debug = debug;
        }
        if let Some(depth) = self.reply_queue_depth
            && depth > 0
        {
            config.reply_queue_depth = depth;
        }
    }
}

impl ClientConfig {
    /// Defaults with `TETHER_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("TETHER_DEBUG") {
            config.debug = parse_env_bool(&value);
        }
        if let Some(depth) = std::env::var("TETHER_REPLY_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            && depth > 0
        {
            config.reply_queue_depth = depth;
        }
        config
    }

    /// Environment config, then a YAML override file on top. The file path
    /// comes from the argument or `TETHER_CLIENT_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(str::to_string)
            .or_else(|| std::env::var("TETHER_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .map_err(|err| ClientError::Config(format!("read client config {path}: {err}")))?;
            let override_cfg: ClientConfigOverride = serde_yaml::from_str(&contents)
                .map_err(|err| ClientError::Config(format!("parse client config yaml: {err}")))?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }
}

fn parse_env_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}
