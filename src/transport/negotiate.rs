//! Opening a connection
//!
//! TCP connect or accept, keep-alive, the optional TLS handshake, the auth
//! provider hooks around it and finally the WebSocket upgrade.

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_async_with_config, client_async_with_config, WebSocketStream};

use crate::auth::{rejected, AuthProvider, HandshakeData, SocketInfo};
use crate::config::KeepAlive;
use crate::error::{Result, SyncError};
use crate::protocol::FrameLimits;
use crate::tls::TlsSettings;
use crate::transport::BoxedStream;

/// A negotiated byte stream, ready for the WebSocket upgrade
pub struct Negotiated {
    pub stream: BoxedStream,
    pub socket: SocketInfo,
    pub handshake: HandshakeData,
}

fn ws_config(limits: &FrameLimits) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(limits.max_frame());
    config.max_frame_size = Some(limits.max_frame());
    config
}

/// Run a provider hook; anything but success surfaces as `AuthRejected`
fn hook(provider: &dyn AuthProvider, stage: &str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e @ SyncError::AuthRejected { .. }) => Err(e),
        Err(e) => {
            tracing::debug!("{} hook '{}' failed: {}", provider.mode(), stage, e);
            Err(rejected(provider, stage))
        }
    }
}

fn socket_info(tcp: &TcpStream) -> Result<SocketInfo> {
    Ok(SocketInfo {
        local_addr: tcp.local_addr()?,
        peer_addr: tcp.peer_addr()?,
    })
}

/// Run the closing hooks for a connection that failed after
/// `on_connection_establishing` succeeded
pub fn abandon(provider: &dyn AuthProvider, socket: &SocketInfo) {
    if let Err(e) = provider.on_connection_closing(socket) {
        tracing::debug!("Auth closing hook failed: {}", e);
    }
    if let Err(e) = provider.on_socket_closed(socket) {
        tracing::debug!("Auth socket-closed hook failed: {}", e);
    }
}

fn tls_handshake_data(session: &tokio_rustls::rustls::CommonState) -> HandshakeData {
    HandshakeData {
        tls: true,
        protocol_version: session.protocol_version().map(|v| format!("{:?}", v)),
        peer_certificates: session
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
            .unwrap_or_default(),
    }
}

/// Client side: connect to `host:port` and negotiate per `tls`
///
/// Settings are validated before any socket is opened.
pub async fn connect(
    host: &str,
    port: u16,
    tls: &TlsSettings,
    keep_alive: &KeepAlive,
    provider: &dyn AuthProvider,
) -> Result<Negotiated> {
    let connector = tls.connector()?;
    let server_name = match &connector {
        Some(_) => Some(
            ServerName::try_from(host.to_string())
                .map_err(|e| SyncError::config(format!("invalid server name '{}': {}", host, e)))?,
        ),
        None => None,
    };

    let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
        SyncError::connection_failed(format!("cannot reach {}:{}: {}", host, port, e))
    })?;
    let _ = tcp.set_nodelay(true);
    if let Err(e) = keep_alive.apply(&tcp) {
        tracing::warn!("Cannot set keep-alive: {}", e);
    }

    let socket = socket_info(&tcp)?;
    hook(
        provider,
        "connection_establishing",
        provider.on_connection_establishing(&socket),
    )?;

    let secured = async {
        let (stream, handshake): (BoxedStream, HandshakeData) = match (connector, server_name) {
            (Some(connector), Some(server_name)) => {
                let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| {
                    SyncError::connection_failed(format!("TLS handshake failed: {}", e))
                })?;
                let handshake = tls_handshake_data(tls_stream.get_ref().1);
                (Box::new(tls_stream), handshake)
            }
            _ => (Box::new(tcp), HandshakeData::default()),
        };
        hook(
            provider,
            "handshake",
            provider.on_handshake_attempt(&handshake),
        )?;
        Ok::<_, SyncError>((stream, handshake))
    };

    match secured.await {
        Ok((stream, handshake)) => Ok(Negotiated {
            stream,
            socket,
            handshake,
        }),
        Err(e) => {
            abandon(provider, &socket);
            Err(e)
        }
    }
}

/// Server side: negotiate an accepted socket
pub async fn accept(
    tcp: TcpStream,
    acceptor: Option<&TlsAcceptor>,
    keep_alive: &KeepAlive,
    provider: &dyn AuthProvider,
) -> Result<Negotiated> {
    let _ = tcp.set_nodelay(true);
    if let Err(e) = keep_alive.apply(&tcp) {
        tracing::warn!("Cannot set keep-alive: {}", e);
    }

    let socket = socket_info(&tcp)?;
    hook(
        provider,
        "connection_establishing",
        provider.on_connection_establishing(&socket),
    )?;

    let secured = async {
        let (stream, handshake): (BoxedStream, HandshakeData) = match acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(tcp).await.map_err(|e| {
                    SyncError::connection_failed(format!(
                        "TLS handshake with {} failed: {}",
                        socket.peer_addr, e
                    ))
                })?;
                let handshake = tls_handshake_data(tls_stream.get_ref().1);
                (Box::new(tls_stream), handshake)
            }
            None => (Box::new(tcp), HandshakeData::default()),
        };
        hook(
            provider,
            "handshake",
            provider.on_handshake_attempt(&handshake),
        )?;
        Ok::<_, SyncError>((stream, handshake))
    };

    match secured.await {
        Ok((stream, handshake)) => Ok(Negotiated {
            stream,
            socket,
            handshake,
        }),
        Err(e) => {
            abandon(provider, &socket);
            Err(e)
        }
    }
}

/// A negotiated and upgraded connection, ready to be driven
pub struct Opened {
    pub ws: WebSocketStream<BoxedStream>,
    pub socket: SocketInfo,
    pub handshake: HandshakeData,
}

/// Client side: `connect` followed by the WebSocket upgrade
pub async fn open_client(
    host: &str,
    port: u16,
    tls: &TlsSettings,
    keep_alive: &KeepAlive,
    provider: &dyn AuthProvider,
    limits: &FrameLimits,
) -> Result<Opened> {
    let negotiated = connect(host, port, tls, keep_alive, provider).await?;
    let socket = negotiated.socket;
    match upgrade_client(negotiated.stream, host, port, limits).await {
        Ok(ws) => Ok(Opened {
            ws,
            socket,
            handshake: negotiated.handshake,
        }),
        Err(e) => {
            abandon(provider, &socket);
            Err(e)
        }
    }
}

/// Server side: `accept` followed by the WebSocket upgrade
pub async fn open_server(
    tcp: TcpStream,
    acceptor: Option<&TlsAcceptor>,
    keep_alive: &KeepAlive,
    provider: &dyn AuthProvider,
    limits: &FrameLimits,
) -> Result<Opened> {
    let negotiated = accept(tcp, acceptor, keep_alive, provider).await?;
    let socket = negotiated.socket;
    match upgrade_server(negotiated.stream, limits).await {
        Ok(ws) => Ok(Opened {
            ws,
            socket,
            handshake: negotiated.handshake,
        }),
        Err(e) => {
            abandon(provider, &socket);
            Err(e)
        }
    }
}

/// Upgrade a client stream to a WebSocket
pub async fn upgrade_client(
    stream: BoxedStream,
    host: &str,
    port: u16,
    limits: &FrameLimits,
) -> Result<WebSocketStream<BoxedStream>> {
    let url = if host.contains(':') {
        format!("ws://[{}]:{}/", host, port)
    } else {
        format!("ws://{}:{}/", host, port)
    };
    let (ws, _response) = client_async_with_config(url, stream, Some(ws_config(limits)))
        .await
        .map_err(|e| SyncError::connection_failed(format!("WebSocket upgrade failed: {}", e)))?;
    Ok(ws)
}

/// Complete the WebSocket upgrade on an accepted stream
pub async fn upgrade_server(
    stream: BoxedStream,
    limits: &FrameLimits,
) -> Result<WebSocketStream<BoxedStream>> {
    accept_async_with_config(stream, Some(ws_config(limits)))
        .await
        .map_err(|e| SyncError::connection_failed(format!("WebSocket handshake failed: {}", e)))
}
