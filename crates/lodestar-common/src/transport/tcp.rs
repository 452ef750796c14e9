use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use super::codec::{read_incoming, write_frame, Incoming};
use super::{Transceiver, Transport};
use crate::protocol::{
    Connector, Endpoint, LodestarError, RequestFrame, ResponseFrame, Result, TransportKind,
};
use crate::trace;

/// Default connect timeout (10 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Async TCP transport.
///
/// Host names are resolved on every call to [`Transport::connectors`], so a
/// DNS change is picked up on the next connection attempt.
///
/// # Example
///
/// ```no_run
/// use lodestar_common::protocol::Endpoint;
/// use lodestar_common::transport::{TcpTransport, Transport};
///
/// # async fn example() -> lodestar_common::Result<()> {
/// let transport = TcpTransport::new();
/// let endpoint = Endpoint::tcp("localhost", 10000);
/// for connector in transport.connectors(&endpoint).await? {
///     println!("{}", connector);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Timeout used for endpoints that carry none of their own.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn check_supported(endpoint: &Endpoint) -> Result<()> {
        if endpoint.transport == TransportKind::Tcp {
            Ok(())
        } else {
            Err(LodestarError::FeatureNotSupported(format!(
                "{} endpoints require a dedicated transport",
                endpoint.transport
            )))
        }
    }

    async fn connect(endpoint: &Endpoint, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let Some(source) = &endpoint.source_address else {
            return TcpStream::connect(addr).await;
        };
        let source: std::net::IpAddr = source
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(source, 0))?;
        socket.connect(addr).await
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connectors(&self, endpoint: &Endpoint) -> Result<Vec<Connector>> {
        Self::check_supported(endpoint)?;
        let addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| LodestarError::Resolution {
                host: endpoint.host.clone(),
                reason: e.to_string(),
            })?;

        let mut connectors: Vec<Connector> = Vec::new();
        for addr in addrs {
            let connector = Connector::new(endpoint.transport, addr, endpoint.host.clone());
            if !connectors.contains(&connector) {
                connectors.push(connector);
            }
        }
        if connectors.is_empty() {
            return Err(LodestarError::Resolution {
                host: endpoint.host.clone(),
                reason: "no addresses".to_string(),
            });
        }
        debug!(target: trace::TRANSPORT, %endpoint, count = connectors.len(), "resolved endpoint");
        Ok(connectors)
    }

    async fn open(&self, endpoint: &Endpoint, connector: &Connector) -> Result<Box<dyn Transceiver>> {
        Self::check_supported(endpoint)?;
        let timeout = endpoint.timeout().unwrap_or(self.connect_timeout);
        let stream = match tokio::time::timeout(timeout, Self::connect(endpoint, connector.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(LodestarError::ConnectFailed(format!("{}: {}", connector, e)));
            }
            Err(_) => return Err(LodestarError::ConnectTimeout(connector.to_string())),
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpTransceiver { stream }))
    }
}

/// A connected TCP stream speaking length-prefixed JSON frames.
pub struct TcpTransceiver {
    stream: TcpStream,
}

#[async_trait]
impl Transceiver for TcpTransceiver {
    async fn send(&mut self, request: &RequestFrame) -> Result<()> {
        write_frame(&mut self.stream, request).await
    }

    async fn receive(&mut self) -> Result<ResponseFrame> {
        match read_incoming(&mut self.stream).await? {
            Incoming::Frame(response) => Ok(response),
            Incoming::CloseNotice => Err(LodestarError::ConnectionClosed { by_peer: true }),
            Incoming::Eof => Err(LodestarError::ConnectionLost(
                "connection closed while awaiting reply".to_string(),
            )),
        }
    }

    async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.stream.shutdown().await;
    }
}
