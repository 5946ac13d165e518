//! Environment-sourced settings.
//!
//! Values are read as-is and never validated here. A missing feed URL or
//! broker host surfaces as a [`crate::error::FetchError`] or
//! [`crate::error::ConnectError`] the first time it is used.

use std::net::SocketAddr;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_EXCHANGE: &str = "amq.topic";

/// Runtime configuration for the relay.
#[derive(Clone, Default)]
pub struct Settings {
    pub api_key: String,
    pub vehicle_positions_url: String,
    pub bind_addr: String,
    pub cors_origin: String,
    pub broker: BrokerSettings,
}

/// Broker connection parameters.
#[derive(Clone, Default)]
pub struct BrokerSettings {
    /// `host[:port]`, optionally prefixed with `tcps://`, `amqps://`,
    /// `tcp://` or `amqp://`.
    pub host: String,
    /// Message VPN, used as the AMQP virtual host.
    pub vpn: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    /// PEM file with extra trust anchors for the broker's TLS certificate.
    pub ca_cert_path: Option<String>,
    /// Accept any broker certificate. Off unless `SOLACE_TLS_SKIP_VERIFY`
    /// is set to a true value.
    pub skip_cert_validation: bool,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &"<redacted>")
            .field("vehicle_positions_url", &self.vehicle_positions_url)
            .field("bind_addr", &self.bind_addr)
            .field("cors_origin", &self.cors_origin)
            .field("broker", &self.broker)
            .finish()
    }
}

impl std::fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("vpn", &self.vpn)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("exchange", &self.exchange)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("skip_cert_validation", &self.skip_cert_validation)
            .finish()
    }
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, treating `None` as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).unwrap_or_default();
        let var_or = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            api_key: var("API_KEY"),
            vehicle_positions_url: var("VEHICLE_POSITIONS_URL"),
            bind_addr: var_or("BIND_ADDR", DEFAULT_BIND_ADDR),
            cors_origin: var_or("CORS_ORIGIN", DEFAULT_CORS_ORIGIN),
            broker: BrokerSettings {
                host: var("SOLACE_HOST"),
                vpn: var("SOLACE_VPN"),
                username: var("SOLACE_USERNAME"),
                password: var("SOLACE_PASSWORD"),
                exchange: var_or("SOLACE_EXCHANGE", DEFAULT_EXCHANGE),
                ca_cert_path: lookup("SOLACE_CA_CERT").filter(|v| !v.trim().is_empty()),
                skip_cert_validation: lookup("SOLACE_TLS_SKIP_VERIFY").is_some_and(|v| is_truthy(&v)),
            },
        }
    }

    /// Parses [`Settings::bind_addr`].
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.bind_addr.parse()
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
