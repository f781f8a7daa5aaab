//! Process configuration with environment overrides.

use std::path::PathBuf;

use log::warn;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_BODY_LIMIT_MB: usize = 50;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub body_limit_mb: usize,
    /// ICC profile for accurate CMYK export. Optional; exports fall back to
    /// RGB when unset or unreadable.
    pub icc_profile: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            port: parse_env("PROXYSHEET_PORT", DEFAULT_PORT),
            body_limit_mb: parse_env("PROXYSHEET_BODY_LIMIT_MB", DEFAULT_BODY_LIMIT_MB),
            icc_profile: std::env::var_os("PROXYSHEET_ICC_PROFILE").map(PathBuf::from),
        }
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb * 1024 * 1024
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: DEFAULT_PORT,
            body_limit_mb: DEFAULT_BODY_LIMIT_MB,
            icc_profile: None,
        }
    }
}

fn parse_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("invalid {name}={value:?}, using default");
            default
        }),
        Err(_) => default,
    }
}
