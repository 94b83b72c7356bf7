//! Counter backend trait for the counting service.

use async_trait::async_trait;

use crate::grpc::proto::rate_limit_response::DescriptorStatus;
use crate::grpc::proto::RateLimitDescriptor;

/// Storage behind the counting service.
///
/// The gRPC service validates requests and delegates each descriptor here,
/// so alternative stores only need to implement counting.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Add `hits` to the descriptor's counter and report its status against
    /// the limit the descriptor declares.
    async fn check_rate_limit(
        &self,
        domain: &str,
        descriptor: &RateLimitDescriptor,
        hits: u32,
    ) -> DescriptorStatus;
}
