//! Environment-driven configuration.
//!
//! `DATABASE_URL` is the only mandatory variable; everything else carries a
//! default suitable for development. In production the variables are
//! injected by the host environment, never from a checked-in file.

use anyhow::{Context, Result};
use std::env;

use crate::trip_tracker::TripParams;

/// Runtime settings assembled once at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,

    /// HTTP/WebSocket server
    pub interface: String,
    pub port: u16,

    /// UDP ingestion
    pub udp_port: u16,
    pub udp_workers: usize,
    pub udp_enabled: bool,

    /// Broadcast dispatchers (forced off when UDP is off)
    pub broadcaster_enabled: bool,

    /// DDNS registration runs as an external sidecar; the flag is accepted
    /// so deployments share one environment file
    pub ddns_enabled: bool,

    pub allowed_origins_http: Vec<String>,
    pub allowed_origins_ws: Vec<String>,

    /// Prometheus exporter; disabled when unset
    pub metrics_port: Option<u16>,

    pub trip_params: TripParams,
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} is not a valid value for {}", value, name)),
        Err(_) => Ok(default),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    if raw.trim() == "*" {
        return vec!["*".to_string()];
    }
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    /// Read and validate the process environment
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL must be set in the environment")?;

        let disable_udp = env_bool("DISABLE_UDP", false);
        let mut udp_enabled = env_bool("UDP_ENABLED", true);
        let mut broadcaster_enabled = env_bool("BROADCASTER_ENABLE", true);

        // DISABLE_UDP wins over UDP_ENABLED; no ingestion means nothing to
        // broadcast either
        if disable_udp {
            udp_enabled = false;
        }
        if !udp_enabled {
            broadcaster_enabled = false;
        }

        let metrics_port = match env::var("METRICS_PORT") {
            Ok(value) => Some(
                value
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| anyhow::anyhow!("METRICS_PORT is not a valid port: {}", value))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            interface: env::var("INTERFACE").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8000)?,
            udp_port: env_parse("UDP_PORT", 9001)?,
            udp_workers: env_parse("UDP_WORKERS", 2usize)?.max(1),
            udp_enabled,
            broadcaster_enabled,
            ddns_enabled: env_bool("DDNS_ENABLED", false),
            allowed_origins_http: parse_origins(
                &env::var("ALLOWED_ORIGINS_HTTP").unwrap_or_else(|_| "*".to_string()),
            ),
            allowed_origins_ws: parse_origins(
                &env::var("ALLOWED_ORIGINS_WS").unwrap_or_else(|_| "*".to_string()),
            ),
            metrics_port,
            trip_params: TripParams {
                spatial_jump_m: env_parse("SPATIAL_JUMP_M", 2000.0)?,
                movement_threshold_m: env_parse("MOVEMENT_THRESHOLD_M", 50.0)?,
                parking_still_count: env_parse("PARKING_STILL_COUNT", 240u32)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "DATABASE_URL",
            "PORT",
            "UDP_PORT",
            "UDP_WORKERS",
            "UDP_ENABLED",
            "DISABLE_UDP",
            "BROADCASTER_ENABLE",
            "DDNS_ENABLED",
            "ALLOWED_ORIGINS_HTTP",
            "ALLOWED_ORIGINS_WS",
            "METRICS_PORT",
            "SPATIAL_JUMP_M",
            "MOVEMENT_THRESHOLD_M",
            "PARKING_STILL_COUNT",
            "INTERFACE",
        ] {
            unsafe {
                std::env::remove_var(name);
            }
        }
    }

    fn set(name: &str, value: &str) {
        unsafe {
            std::env::set_var(name, value);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        set("DATABASE_URL", "postgres://localhost/fleetrack");

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.udp_port, 9001);
        assert!(settings.udp_enabled);
        assert!(settings.broadcaster_enabled);
        assert!(!settings.ddns_enabled);
        assert_eq!(settings.allowed_origins_http, vec!["*"]);
        assert!(settings.metrics_port.is_none());

        // Detector thresholds as documented
        assert_eq!(settings.trip_params.spatial_jump_m, 2000.0);
        assert_eq!(settings.trip_params.movement_threshold_m, 50.0);
        assert_eq!(settings.trip_params.parking_still_count, 240);
    }

    #[test]
    #[serial]
    fn test_database_url_is_required() {
        clear_env();
        assert!(Settings::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_disable_udp_forces_broadcaster_off() {
        clear_env();
        set("DATABASE_URL", "postgres://localhost/fleetrack");
        set("DISABLE_UDP", "true");
        set("UDP_ENABLED", "true");
        set("BROADCASTER_ENABLE", "true");

        let settings = Settings::from_env().unwrap();
        assert!(!settings.udp_enabled);
        assert!(!settings.broadcaster_enabled);
    }

    #[test]
    #[serial]
    fn test_udp_off_disables_broadcaster() {
        clear_env();
        set("DATABASE_URL", "postgres://localhost/fleetrack");
        set("UDP_ENABLED", "0");

        let settings = Settings::from_env().unwrap();
        assert!(!settings.udp_enabled);
        assert!(!settings.broadcaster_enabled);
    }

    #[test]
    #[serial]
    fn test_origin_lists() {
        clear_env();
        set("DATABASE_URL", "postgres://localhost/fleetrack");
        set(
            "ALLOWED_ORIGINS_HTTP",
            "https://fleet.example.com, https://ops.example.com",
        );

        let settings = Settings::from_env().unwrap();
        assert_eq!(
            settings.allowed_origins_http,
            vec!["https://fleet.example.com", "https://ops.example.com"]
        );
    }

    #[test]
    #[serial]
    fn test_threshold_overrides() {
        clear_env();
        set("DATABASE_URL", "postgres://localhost/fleetrack");
        set("SPATIAL_JUMP_M", "3000");
        set("PARKING_STILL_COUNT", "120");

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.trip_params.spatial_jump_m, 3000.0);
        assert_eq!(settings.trip_params.parking_still_count, 120);
    }

    #[test]
    #[serial]
    fn test_invalid_port_rejected() {
        clear_env();
        set("DATABASE_URL", "postgres://localhost/fleetrack");
        set("PORT", "not-a-port");
        assert!(Settings::from_env().is_err());
    }
}
