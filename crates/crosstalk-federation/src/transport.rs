// Outbound WebSocket dial to a peer signaling server.
//
// The peer advertises its capabilities in the upgrade response header;
// dialing fails before any signaling traffic if the `federation` feature is
// absent. Certificate verification follows the tunnel configuration.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crosstalk_proto::{FEATURES_HEADER, FEATURE_FEDERATION, MAX_MESSAGE_SIZE};

use crate::{FederationConfig, FederationError};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Rewrite an HTTP(S) signaling URL to its WebSocket equivalent.
pub(crate) fn to_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

fn supports_federation(features: &str) -> bool {
    features.split(',').any(|f| f.trim() == FEATURE_FEDERATION)
}

/// Dial `url` and verify the peer accepts federated sessions.
pub(crate) async fn connect(
    url: &str,
    config: &FederationConfig,
) -> Result<WsStream, FederationError> {
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE));

    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(config.insecure_skip_verify)
        .build()?;

    let request = url.into_client_request()?;
    let dial =
        connect_async_tls_with_config(request, Some(ws_config), false, Some(Connector::NativeTls(tls)));
    let (mut stream, response) = tokio::time::timeout(config.connect_timeout(), dial)
        .await
        .map_err(|_| FederationError::Timeout("connecting to the remote server"))??;

    let features = response
        .headers()
        .get(FEATURES_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !supports_federation(features) {
        if let Err(err) = stream.close(None).await {
            debug!(url, error = %err, "error closing connection to unsupported peer");
        }
        return Err(FederationError::Unsupported);
    }

    Ok(stream)
}
