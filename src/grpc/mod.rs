//! gRPC protocol for the shared counting service.
//!
//! The generated client is used by the global limit client; the generated
//! server hosts the reference counting service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::RateLimitServiceImpl;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("meshguard.ratelimit.v1");
}

// Re-export commonly used types
pub use proto::rate_limit_service_client::RateLimitServiceClient;
pub use proto::rate_limit_service_server::RateLimitServiceServer;
pub use proto::{RateLimitDescriptor, RateLimitRequest, RateLimitResponse};

use std::time::Duration;

/// Convert a wire duration, treating negative values as zero.
pub(crate) fn duration_from_proto(duration: &prost_types::Duration) -> Duration {
    if duration.seconds < 0 {
        return Duration::ZERO;
    }
    Duration::new(duration.seconds as u64, duration.nanos.max(0) as u32)
}

pub(crate) fn duration_to_proto(duration: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::GrpcServer;
    use crate::counting::CounterBackend;

    /// Serve `backend` on an ephemeral local port until the sender is dropped.
    pub async fn spawn_server<B: CounterBackend + 'static>(
        backend: Arc<B>,
    ) -> (SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let server = GrpcServer::new(addr, backend);
            let _ = server
                .serve_on(listener, async {
                    let _ = rx.await;
                })
                .await;
        });

        (addr, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversion() {
        let d = Duration::from_millis(2500);
        assert_eq!(duration_from_proto(&duration_to_proto(d)), d);

        let negative = prost_types::Duration {
            seconds: -3,
            nanos: 0,
        };
        assert_eq!(duration_from_proto(&negative), Duration::ZERO);
    }
}
