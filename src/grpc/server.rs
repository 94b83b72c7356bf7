//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::rate_limit_service_server::RateLimitServiceServer;
use super::service::RateLimitServiceImpl;
use crate::counting::CounterBackend;
use crate::error::{MeshguardError, Result};

/// gRPC server for the reference counting service.
pub struct GrpcServer<B: CounterBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The counter store answering requests
    backend: Arc<B>,
}

impl<B: CounterBackend + 'static> GrpcServer<B> {
    /// Create a new gRPC server over `backend`.
    pub fn new(addr: SocketAddr, backend: Arc<B>) -> Self {
        Self { addr, backend }
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = RateLimitServiceImpl::new(self.backend);

        info!(
            addr = %self.addr,
            "Starting gRPC server for RateLimitService with graceful shutdown"
        );

        Server::builder()
            .add_service(RateLimitServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                MeshguardError::Grpc(e)
            })
    }

    /// Serve on an already bound listener instead of the configured address.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = RateLimitServiceImpl::new(self.backend);

        info!(
            addr = ?listener.local_addr().ok(),
            "Starting gRPC server for RateLimitService on bound listener"
        );

        Server::builder()
            .add_service(RateLimitServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                MeshguardError::Grpc(e)
            })
    }
}
