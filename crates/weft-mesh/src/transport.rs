//! Transport layer: iroh QUIC + tarpc RPC.
//!
//! `EndpointTransport` wraps an iroh `Endpoint` for QUIC communication
//! between the coordinator and workers. `WorkerService` defines the RPC
//! surface a worker exposes. `RpcStream` bridges iroh's split send/recv
//! streams into a single `AsyncRead + AsyncWrite` for tarpc.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use iroh::endpoint::{Connection, Incoming, RecvStream, SendStream};
use iroh::Endpoint;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::DistError;
use crate::protocol::GraphChunk;

/// ALPN protocol identifier for weft-mesh.
pub const ALPN: &[u8] = b"weft-mesh/0";

/// Wraps an iroh QUIC endpoint with weft-specific connection management.
pub struct EndpointTransport {
    endpoint: Endpoint,
}

impl EndpointTransport {
    /// Bind a new endpoint with the weft ALPN.
    pub async fn new() -> Result<Self, DistError> {
        let endpoint = Endpoint::builder()
            .alpns(vec![ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| DistError::Transport(e.to_string()))?;
        Ok(Self { endpoint })
    }

    /// Wrap an existing endpoint.
    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// This endpoint's identity (public key).
    pub fn id(&self) -> iroh::EndpointId {
        self.endpoint.id()
    }

    /// This endpoint's resolvable address.
    pub fn addr(&self) -> iroh::EndpointAddr {
        self.endpoint.addr()
    }

    /// Connect to a peer by address.
    pub async fn connect(&self, peer: iroh::EndpointAddr) -> Result<Connection, DistError> {
        let conn = self.endpoint.connect(peer, ALPN).await?;
        Ok(conn)
    }

    /// Accept an incoming connection. `None` when the endpoint is closing.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// The underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Close the transport.
    pub async fn close(self) {
        self.endpoint.close().await;
    }
}

// ---------------------------------------------------------------------------
// RpcStream — bridge iroh QUIC to AsyncRead + AsyncWrite
// ---------------------------------------------------------------------------

/// Combines iroh QUIC send/recv streams into a single bidirectional stream
/// implementing `AsyncRead + AsyncWrite` for tarpc's serde transport.
#[pin_project]
pub struct RpcStream {
    #[pin]
    recv: RecvStream,
    #[pin]
    send: SendStream,
}

impl RpcStream {
    /// Create a new bidirectional RPC stream.
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { recv, send }
    }
}

impl AsyncRead for RpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().send, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}

/// Create a tarpc serde transport from an `RpcStream`.
///
/// Length-delimited framing + JSON codec.
pub fn rpc_transport<Item, SinkItem>(
    stream: RpcStream,
) -> tarpc::serde_transport::Transport<
    RpcStream,
    Item,
    SinkItem,
    tokio_serde::formats::Json<Item, SinkItem>,
>
where
    Item: for<'de> serde::Deserialize<'de>,
    SinkItem: serde::Serialize,
{
    tarpc::serde_transport::new(
        tokio_util::codec::length_delimited::Builder::new().new_framed(stream),
        tokio_serde::formats::Json::default(),
    )
}

// ---------------------------------------------------------------------------
// WorkerService — tarpc RPC interface
// ---------------------------------------------------------------------------

/// RPC surface of a worker.
///
/// The coordinator drives these per worker. `create_computation` must be
/// safe to issue concurrently across workers; everything else is scoped by
/// the computation id it returns.
#[tarpc::service]
pub trait WorkerService {
    /// Build a remote sub-computation from the shared chunk stream plus
    /// this worker's return and parameter name subsets.
    async fn create_computation(
        comp_id: u64,
        chunks: Vec<GraphChunk>,
        returns: Vec<String>,
        params: Vec<String>,
    ) -> Result<(), String>;

    /// Bind parameter values, in this worker's local feed order.
    async fn feed_inputs(comp_id: u64, values: Vec<Vec<f32>>) -> Result<(), String>;

    /// Deliver relayed send values, keyed by send-node name.
    async fn feed_received(
        comp_id: u64,
        values: Vec<(String, Vec<f32>)>,
    ) -> Result<(), String>;

    /// Execute and return this worker's results, one per return, in the
    /// order of the return subset given at creation.
    async fn collect_results(comp_id: u64) -> Result<Vec<(String, Vec<f32>)>, String>;

    /// Health check ping. Returns the same sequence number.
    async fn ping(seq: u64) -> u64;

    /// Graceful shutdown.
    async fn shutdown() -> Result<(), String>;
}
