use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::codec::{read_frame, write_close_notice, write_frame};
use crate::protocol::{LodestarError, ReplyStatus, RequestFrame, ResponseFrame, Result};
use crate::trace;

/// Async TCP server dispatching request frames to a handler.
///
/// Each accepted connection is served on its own task and may carry any
/// number of requests, unless capped with
/// [`FrameServer::with_max_requests_per_connection`]. Oneway requests are
/// dispatched without a reply.
pub struct FrameServer {
    listener: TcpListener,
    max_requests: Option<usize>,
}

impl FrameServer {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:10000")
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            LodestarError::ConnectFailed(format!("failed to bind to {}: {}", bind_addr, e))
        })?;
        Ok(Self {
            listener,
            max_requests: None,
        })
    }

    /// Closes each connection gracefully once it has carried `max` requests.
    ///
    /// The request arriving after the last one allowed is not dispatched; the
    /// server answers it with a close notice, so the caller may resend it on a
    /// new connection.
    pub fn with_max_requests_per_connection(mut self, max: usize) -> Self {
        self.max_requests = Some(max);
        self
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop with the given request handler.
    ///
    /// Handler errors are reported to the caller as `UnknownException` replies.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(RequestFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseFrame>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!(target: trace::TRANSPORT, %peer_addr, "accepted connection");

            let handler = handler.clone();
            let max_requests = self.max_requests;
            tokio::spawn(async move {
                match serve_connection(stream, handler, max_requests).await {
                    Ok(()) => debug!(target: trace::TRANSPORT, %peer_addr, "connection closed by peer"),
                    Err(e) => warn!(target: trace::TRANSPORT, %peer_addr, error = %e, "connection error"),
                }
            });
        }
    }
}

async fn serve_connection<F, Fut>(
    mut stream: TcpStream,
    handler: Arc<F>,
    max_requests: Option<usize>,
) -> Result<()>
where
    F: Fn(RequestFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseFrame>> + Send + 'static,
{
    let mut served = 0usize;
    loop {
        let request: RequestFrame = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(LodestarError::ConnectionClosed { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        if max_requests.is_some_and(|max| served >= max) {
            debug!(target: trace::TRANSPORT, operation = %request.operation, served, "request limit reached, closing connection");
            write_close_notice(&mut stream).await?;
            return Ok(());
        }
        served += 1;

        let request_id = request.id;
        let oneway = request.oneway;
        let operation = request.operation.clone();
        let response = match handler(request).await {
            Ok(response) => response,
            Err(e) => {
                info!(target: trace::TRANSPORT, %operation, error = %e, "dispatch failed");
                ResponseFrame::failure(
                    request_id,
                    ReplyStatus::UnknownException,
                    serde_json::Value::String(e.to_string()),
                )
            }
        };

        if !oneway {
            write_frame(&mut stream, &response).await?;
        }
    }
}
