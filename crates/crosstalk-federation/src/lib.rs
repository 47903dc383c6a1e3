//! Outbound federation tunnels for the crosstalk signaling fabric.
//!
//! When a local client joins a room homed on a peer signaling server, the
//! hub opens a [`FederationClient`] on the client's behalf: a second
//! signaling session that authenticates against the peer with the join's
//! bearer token, joins the remote room and then proxies messages in both
//! directions while translating session identities. The owning session
//! never sees the remote session id of its own tunnel, and the peer never
//! sees the locally allocated one.

mod client;
mod transport;

pub use client::FederationClient;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crosstalk_proto::{ServerMessage, SignalingError};
use crosstalk_proto::{ERROR_FEDERATION_ERROR, ERROR_FEDERATION_UNSUPPORTED};

/// The narrow slice of the primary session a federation tunnel interacts
/// with. The hub-side client session implements this; tests use a
/// channel-backed capture.
pub trait LocalSession: Send + Sync + 'static {
    /// The session id this client is known by on the local server.
    fn public_id(&self) -> String;

    /// Deliver a server message to the client as if a local peer sent it.
    fn send_message(&self, message: ServerMessage);
}

/// Errors produced by a federation tunnel.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    /// The peer does not advertise the `federation` feature.
    #[error("the remote server does not support federation")]
    Unsupported,
    /// The message handed to [`FederationClient::connect`] is not a
    /// federated room join.
    #[error("invalid federated join message: {0}")]
    InvalidJoin(String),
    /// The tunnel is closed; no I/O was performed.
    #[error("not connected to the remote server")]
    NotConnected,
    /// A close frame already went out on this connection; nothing else can
    /// be written.
    #[error("connection close already sent")]
    CloseSent,
    /// The handshake was abandoned.
    #[error("federation handshake failed: {0}")]
    Handshake(String),
    /// In-band error received from the peer.
    #[error("{0}")]
    Remote(SignalingError),
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

impl FederationError {
    /// The in-band error payload delivered to the primary session when this
    /// error tears the tunnel down. Errors the peer sent are surfaced
    /// verbatim; everything else is wrapped in a federation error code.
    pub fn to_signaling_error(&self) -> SignalingError {
        match self {
            Self::Remote(error) => error.clone(),
            Self::Unsupported => {
                SignalingError::new(ERROR_FEDERATION_UNSUPPORTED, self.to_string())
            }
            other => SignalingError::new(ERROR_FEDERATION_ERROR, other.to_string()),
        }
    }
}

/// Federation tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Skip TLS certificate verification when dialing peers. Off by
    /// default; intended for clusters running on self-signed certificates.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Timeout for establishing the connection to the peer, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl FederationConfig {
    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_surface_verbatim() {
        let err = FederationError::Remote(SignalingError::new("invalid_token", "expired"));
        let wire = err.to_signaling_error();
        assert_eq!(wire.code, "invalid_token");
        assert_eq!(wire.message, "expired");
    }

    #[test]
    fn unsupported_peers_get_a_dedicated_code() {
        let wire = FederationError::Unsupported.to_signaling_error();
        assert_eq!(wire.code, ERROR_FEDERATION_UNSUPPORTED);
    }

    #[test]
    fn local_failures_are_wrapped() {
        let wire = FederationError::Handshake("too many hello retries".into()).to_signaling_error();
        assert_eq!(wire.code, ERROR_FEDERATION_ERROR);
        assert!(wire.message.contains("too many hello retries"));
    }

    #[test]
    fn config_defaults_are_safe() {
        let config: FederationConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.insecure_skip_verify);
        assert_eq!(config.connect_timeout_secs, 10);
    }
}
