#![forbid(unsafe_code)]

// Server configuration loaded from environment variables

use crate::media::MediaConfig;
use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 3000;

/// Process-wide server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub media: MediaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            media: MediaConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from the process environment
    ///
    /// # Errors
    /// Returns an error if a variable is set but cannot be parsed, or the
    /// resulting configuration is inconsistent
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for unset keys
    ///
    /// # Errors
    /// See [`ServerConfig::from_env`]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = parse(&lookup, "PORT")? {
            config.port = port;
        }

        let workers = &mut config.media.worker_config;
        if let Some(num_workers) = parse::<usize>(&lookup, "NUM_WORKERS")? {
            workers.num_workers = num_workers;
        }
        if let Some(min) = parse(&lookup, "RTC_MIN_PORT")? {
            workers.rtc_min_port = min;
        }
        if let Some(max) = parse(&lookup, "RTC_MAX_PORT")? {
            workers.rtc_max_port = max;
        }
        if workers.num_workers == 0 {
            bail!("NUM_WORKERS must be at least 1");
        }
        if workers.rtc_min_port > workers.rtc_max_port {
            bail!(
                "RTC_MIN_PORT ({}) must not exceed RTC_MAX_PORT ({})",
                workers.rtc_min_port,
                workers.rtc_max_port
            );
        }

        let transport = &mut config.media.transport_config;
        if let Some(ip) = parse::<IpAddr>(&lookup, "LISTEN_IP")? {
            transport.listen_ip = ip;
        }
        if let Some(ip) = parse::<IpAddr>(&lookup, "ANNOUNCED_IP")? {
            transport.announced_ip = Some(ip);
        }
        if let Some(bitrate) = parse(&lookup, "MAX_INCOMING_BITRATE")? {
            transport.max_incoming_bitrate = Some(bitrate);
        }
        if let Some(bitrate) = parse(&lookup, "INITIAL_OUTGOING_BITRATE")? {
            transport.initial_available_outgoing_bitrate = bitrate;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => {
            let value = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {key}: {raw}"))?;
            Ok(Some(value))
        }
    }
}
