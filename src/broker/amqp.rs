//! AMQP transport backed by `lapin`.
//!
//! Grid topics are sent as routing keys on a topic exchange. The message VPN
//! becomes the AMQP virtual host. Publisher confirms are never enabled, so a
//! send either hands the frame to the socket or fails on the spot; nothing is
//! buffered for later delivery.
//!
//! TLS trust follows [`BrokerSettings`]: the platform roots by default, an
//! extra PEM bundle when `ca_cert_path` is set, or no certificate
//! validation at all when `skip_cert_validation` is set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::tcp::{HandshakeResult, NativeTlsConnector, OwnedTLSConfig, TcpStream};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use super::{BrokerConnection, Connector, OutboundMessage, PublishSession};
use crate::config::BrokerSettings;
use crate::error::{ConnectError, PublishError};

const CONNECTION_NAME: &str = "transit-grid-relay";
const AMQPS_PORT: u16 = 5671;
const AMQP_PORT: u16 = 5672;
const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// How the TLS handshake decides whether to trust the broker.
enum TlsTrust {
    /// Platform trust store.
    System,
    /// Platform trust store plus a PEM bundle.
    Bundle(OwnedTLSConfig),
    /// Any certificate and host name are accepted.
    Unverified(NativeTlsConnector),
}

/// Connects to the broker described by [`BrokerSettings`].
pub struct AmqpConnector {
    settings: BrokerSettings,
}

impl AmqpConnector {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }

    fn uri(&self) -> Result<AMQPUri, ConnectError> {
        let (scheme, host, port) = parse_host(&self.settings.host)?;
        let vhost = if self.settings.vpn.is_empty() {
            "/".to_string()
        } else {
            self.settings.vpn.clone()
        };

        Ok(AMQPUri {
            scheme,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.settings.username.clone(),
                    password: self.settings.password.clone(),
                },
                host,
                port,
            },
            vhost,
            query: AMQPQueryString {
                connection_timeout: Some(CONNECT_TIMEOUT_MS),
                ..Default::default()
            },
        })
    }

    fn tls_trust(&self) -> Result<TlsTrust, ConnectError> {
        if self.settings.skip_cert_validation {
            let connector = NativeTlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| ConnectError::Config(format!("cannot build TLS connector: {e}")))?;
            return Ok(TlsTrust::Unverified(connector));
        }

        let Some(path) = &self.settings.ca_cert_path else {
            return Ok(TlsTrust::System);
        };
        let cert_chain = std::fs::read_to_string(path)
            .map_err(|e| ConnectError::Config(format!("cannot read CA bundle {path}: {e}")))?;
        Ok(TlsTrust::Bundle(OwnedTLSConfig {
            identity: None,
            cert_chain: Some(cert_chain),
        }))
    }
}

/// Opens the socket and, for `amqps`, runs the handshake with `tls`.
fn connect_unverified(uri: &AMQPUri, tls: &NativeTlsConnector) -> HandshakeResult {
    let addr = (uri.authority.host.as_str(), uri.authority.port);
    let stream = match uri.query.connection_timeout {
        Some(ms) => TcpStream::connect_timeout(addr, Duration::from_millis(ms))?,
        None => TcpStream::connect(addr)?,
    };
    let stream = match uri.scheme {
        AMQPScheme::AMQP => stream,
        AMQPScheme::AMQPS => stream.into_native_tls(tls, &uri.authority.host)?,
    };
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Splits `[scheme://]host[:port]` into its parts. No scheme means TLS.
fn parse_host(raw: &str) -> Result<(AMQPScheme, String, u16), ConnectError> {
    let raw = raw.trim().trim_end_matches('/');
    if raw.is_empty() {
        return Err(ConnectError::Config("SOLACE_HOST is not set".to_string()));
    }

    let (scheme, rest) = match raw.split_once("://") {
        Some(("tcps" | "amqps" | "ssl", rest)) => (AMQPScheme::AMQPS, rest),
        Some(("tcp" | "amqp", rest)) => (AMQPScheme::AMQP, rest),
        Some((other, _)) => {
            return Err(ConnectError::Config(format!(
                "unsupported broker scheme '{other}'"
            )));
        }
        None => (AMQPScheme::AMQPS, raw),
    };

    let default_port = match scheme {
        AMQPScheme::AMQPS => AMQPS_PORT,
        AMQPScheme::AMQP => AMQP_PORT,
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ConnectError::Config(format!("invalid broker port '{port}'")))?;
            (host, port)
        }
        None => (rest, default_port),
    };

    if host.is_empty() {
        return Err(ConnectError::Config(format!("no host in '{raw}'")));
    }

    Ok((scheme, host.to_string(), port))
}

#[async_trait]
impl Connector for AmqpConnector {
    #[tracing::instrument(name = "broker_connect", skip(self), fields(host = %self.settings.host, vpn = %self.settings.vpn))]
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ConnectError> {
        let uri = self.uri()?;
        let properties = ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into());

        let result = match self.tls_trust()? {
            TlsTrust::System => Connection::connect_uri(uri, properties).await,
            TlsTrust::Bundle(tls) => Connection::connect_uri_with_config(uri, properties, tls).await,
            TlsTrust::Unverified(tls) => {
                warn!("Broker certificate validation is disabled");
                Connection::connector(
                    uri,
                    Box::new(move |uri: &AMQPUri| connect_unverified(uri, &tls)),
                    properties,
                )
                .await
            }
        };
        let conn = result.map_err(|e| ConnectError::Transport(e.to_string()))?;

        Ok(Arc::new(AmqpConnection {
            conn,
            exchange: self.settings.exchange.clone(),
        }))
    }
}

struct AmqpConnection {
    conn: Connection,
    exchange: String,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn open_session(&self) -> Result<Box<dyn PublishSession>, PublishError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| PublishError::Session(e.to_string()))?;
        debug!(channel = channel.id(), "Publish channel opened");

        Ok(Box::new(AmqpSession {
            channel,
            exchange: self.exchange.clone(),
        }))
    }

    async fn close(&self) {
        if let Err(e) = self.conn.close(200, "relay shutting down").await {
            warn!(error = %e, "Error closing broker connection");
        }
    }
}

struct AmqpSession {
    channel: Channel,
    exchange: String,
}

#[async_trait]
impl PublishSession for AmqpSession {
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), PublishError> {
        let properties = BasicProperties::default()
            .with_message_id(message.app_message_id.as_str().into())
            .with_content_type("application/json".into());

        let _confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                &message.topic,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| PublishError::Send {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn terminate(self: Box<Self>) {
        if let Err(e) = self.channel.close(200, "publish pass complete").await {
            warn!(error = %e, "Error closing publish channel");
        }
    }
}
