//! Server configuration — all from environment variables.
//!
//! Every value is validated at startup; anything outside its documented
//! range is a hard error naming the offending variable. The SSE/POST/RPC
//! paths and the waveform store path belong to the agent-facing layer that
//! embeds this crate — they are validated and exposed here but not consumed
//! by the core.

use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::BridgeError;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port for WebSocket + HTTP.
    pub port: u16,
    /// Address the QR URL advertises instead of the bound one.
    pub public_ip: Option<String>,
    /// SSE stream path of the embedding agent layer.
    pub sse_path: String,
    /// Message POST path of the embedding agent layer.
    pub post_path: String,
    /// Optional JSON-RPC path of the embedding agent layer.
    pub rpc_path: Option<String>,
    /// On-disk waveform library location (agent layer).
    pub waveform_store_path: Option<PathBuf>,
    /// Interval between server heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Idle TTL after which a device session is swept.
    pub stale_device_timeout: Duration,
    /// Window for an unbound session to complete the bind handshake.
    pub connection_timeout: Duration,
    /// Window for a bound-but-disconnected device to re-pair.
    pub reconnection_timeout: Duration,
    /// Log level filter.
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, BridgeError> {
        let port = parsed("PORT", 3323u16)?;
        if port == 0 {
            return Err(invalid("PORT", "must be 1..=65535"));
        }

        let public_ip = env::var("PUBLIC_IP").ok().filter(|s| !s.is_empty());
        if let Some(ip) = &public_ip {
            if ip.parse::<Ipv4Addr>().is_err() {
                return Err(invalid("PUBLIC_IP", "must be a dotted-quad IPv4 address"));
            }
        }

        let sse_path = path_var("SSE_PATH", Some("/sse"))?.unwrap_or_default();
        let post_path = path_var("POST_PATH", Some("/message"))?.unwrap_or_default();
        let rpc_path = path_var("RPC_PATH", None)?;

        let heartbeat_ms = parsed("HEARTBEAT_INTERVAL_MS", 30_000u64)?;
        if heartbeat_ms < 1000 {
            return Err(invalid("HEARTBEAT_INTERVAL_MS", "must be at least 1000"));
        }

        let stale_ms = parsed("STALE_DEVICE_TIMEOUT_MS", 3_600_000u64)?;
        if stale_ms < 60_000 {
            return Err(invalid("STALE_DEVICE_TIMEOUT_MS", "must be at least 60000"));
        }

        let connection_min = parsed("CONNECTION_TIMEOUT_MINUTES", 5u64)?;
        if !(1..=60).contains(&connection_min) {
            return Err(invalid("CONNECTION_TIMEOUT_MINUTES", "must be 1..=60"));
        }

        let reconnection_min = parsed("RECONNECTION_TIMEOUT_MINUTES", 5u64)?;
        if !(1..=60).contains(&reconnection_min) {
            return Err(invalid("RECONNECTION_TIMEOUT_MINUTES", "must be 1..=60"));
        }

        Ok(Self {
            port,
            public_ip,
            sse_path,
            post_path,
            rpc_path,
            waveform_store_path: env::var("WAVEFORM_STORE_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            stale_device_timeout: Duration::from_millis(stale_ms),
            connection_timeout: Duration::from_secs(connection_min * 60),
            reconnection_timeout: Duration::from_secs(reconnection_min * 60),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "dglabd=info,tower_http=info".into()),
        })
    }
}

fn invalid(var: &'static str, reason: &str) -> BridgeError {
    BridgeError::Config {
        var,
        reason: reason.to_owned(),
    }
}

fn parsed<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, BridgeError> {
    match env::var(var) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| invalid(var, &format!("cannot parse {raw:?}"))),
        _ => Ok(default),
    }
}

fn path_var(var: &'static str, default: Option<&str>) -> Result<Option<String>, BridgeError> {
    let value = match env::var(var) {
        Ok(raw) if !raw.is_empty() => Some(raw),
        _ => default.map(ToOwned::to_owned),
    };
    if let Some(p) = &value {
        if !p.starts_with('/') {
            return Err(invalid(var, "must begin with '/'"));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment is process-global, so everything lives in one test.
    #[test]
    fn from_env_defaults_and_validation() {
        for var in [
            "PORT",
            "PUBLIC_IP",
            "SSE_PATH",
            "POST_PATH",
            "RPC_PATH",
            "WAVEFORM_STORE_PATH",
            "HEARTBEAT_INTERVAL_MS",
            "STALE_DEVICE_TIMEOUT_MS",
            "CONNECTION_TIMEOUT_MINUTES",
            "RECONNECTION_TIMEOUT_MINUTES",
        ] {
            env::remove_var(var);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 3323);
        assert_eq!(config.sse_path, "/sse");
        assert_eq!(config.post_path, "/message");
        assert_eq!(config.rpc_path, None);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.stale_device_timeout, Duration::from_secs(3600));
        assert_eq!(config.connection_timeout, Duration::from_secs(300));
        assert_eq!(config.reconnection_timeout, Duration::from_secs(300));

        env::set_var("PORT", "0");
        assert!(Config::from_env().is_err());
        env::set_var("PORT", "not-a-port");
        assert!(Config::from_env().is_err());
        env::remove_var("PORT");

        env::set_var("PUBLIC_IP", "203.0.113.7");
        assert_eq!(Config::from_env().unwrap().public_ip.as_deref(), Some("203.0.113.7"));
        env::set_var("PUBLIC_IP", "example.com");
        assert!(Config::from_env().is_err());
        env::remove_var("PUBLIC_IP");

        env::set_var("SSE_PATH", "events");
        assert!(Config::from_env().is_err());
        env::set_var("SSE_PATH", "/events");
        assert_eq!(Config::from_env().unwrap().sse_path, "/events");
        env::remove_var("SSE_PATH");

        env::set_var("HEARTBEAT_INTERVAL_MS", "500");
        assert!(Config::from_env().is_err());
        env::remove_var("HEARTBEAT_INTERVAL_MS");

        env::set_var("CONNECTION_TIMEOUT_MINUTES", "61");
        assert!(Config::from_env().is_err());
        env::set_var("CONNECTION_TIMEOUT_MINUTES", "1");
        assert_eq!(
            Config::from_env().unwrap().connection_timeout,
            Duration::from_secs(60)
        );
        env::remove_var("CONNECTION_TIMEOUT_MINUTES");
    }
}
