//! Lodestar Transport Layer
//!
//! The invocation engine talks to servers only through the [`Transport`] and
//! [`Transceiver`] traits. [`TcpTransport`] is the built-in implementation;
//! tests substitute in-memory ones.
//!
//! # Wire Format
//!
//! `[4-byte length prefix as u32 big-endian] + [JSON frame]`, at most 100 MB
//! per frame. Oneway requests get no reply frame. A zero-length frame is a
//! close notice: the peer is closing and will not dispatch anything sent
//! after its last reply.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

use async_trait::async_trait;

use crate::protocol::{Connector, Endpoint, RequestFrame, ResponseFrame, Result};

pub use codec::{read_frame, read_incoming, write_close_notice, write_frame, Incoming, JsonCodec, MAX_FRAME_SIZE};
pub use tcp::{TcpTransceiver, TcpTransport};
pub use tcp_server::FrameServer;

/// Factory for connections to endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves an endpoint into one connector per network address.
    async fn connectors(&self, endpoint: &Endpoint) -> Result<Vec<Connector>>;

    /// Opens a connection to `connector` on behalf of `endpoint`.
    async fn open(&self, endpoint: &Endpoint, connector: &Connector) -> Result<Box<dyn Transceiver>>;
}

/// One established connection, used by a single exchange at a time.
#[async_trait]
pub trait Transceiver: Send {
    async fn send(&mut self, request: &RequestFrame) -> Result<()>;

    /// Waits for the reply to the request last sent.
    ///
    /// Yields `ConnectionClosed { by_peer: true }` only when the peer announced
    /// the close. A connection that drops while the reply is awaited is
    /// `ConnectionLost`, since the request may have been dispatched.
    async fn receive(&mut self) -> Result<ResponseFrame>;

    async fn close(&mut self);
}
