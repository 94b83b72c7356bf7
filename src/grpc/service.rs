//! The counting service gRPC handler.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::{
    rate_limit_response::Code, rate_limit_service_server::RateLimitService, RateLimitRequest,
    RateLimitResponse,
};
use super::duration_from_proto;
use crate::counting::CounterBackend;

/// Implementation of the RateLimitService gRPC interface.
pub struct RateLimitServiceImpl<B: CounterBackend> {
    /// The counter backend
    backend: Arc<B>,
}

impl<B: CounterBackend> RateLimitServiceImpl<B> {
    /// Create a new RateLimitServiceImpl over the given backend.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

/// Reject requests the counting store cannot answer meaningfully.
fn validate(req: &RateLimitRequest) -> Result<(), Status> {
    if req.domain.is_empty() {
        return Err(Status::invalid_argument("domain must not be empty"));
    }
    if req.descriptors.is_empty() {
        return Err(Status::invalid_argument("request carries no descriptors"));
    }

    let unusable = req.descriptors.iter().position(|d| {
        !d.limit.as_ref().is_some_and(|l| {
            l.requests_per_unit > 0
                && l.window
                    .as_ref()
                    .is_some_and(|w| !duration_from_proto(w).is_zero())
        })
    });
    if let Some(index) = unusable {
        return Err(Status::invalid_argument(format!(
            "descriptor {} must declare a non-zero limit and window",
            index
        )));
    }
    Ok(())
}

#[tonic::async_trait]
impl<B: CounterBackend + 'static> RateLimitService for RateLimitServiceImpl<B> {
    /// Count a batch of descriptors and report which are over their limit.
    #[instrument(
        name = "should_rate_limit",
        skip_all,
        fields(
            domain = %request.get_ref().domain,
            descriptors = request.get_ref().descriptors.len()
        )
    )]
    async fn should_rate_limit(
        &self,
        request: Request<RateLimitRequest>,
    ) -> Result<Response<RateLimitResponse>, Status> {
        let req = request.into_inner();
        if let Err(status) = validate(&req) {
            warn!(error = %status.message(), "Rejecting counting request");
            return Err(status);
        }

        // Zero means the client did not set it
        let hits = req.hits_addend.max(1);

        let mut statuses = Vec::with_capacity(req.descriptors.len());
        for descriptor in &req.descriptors {
            statuses.push(self.backend.check_rate_limit(&req.domain, descriptor, hits).await);
        }

        let over = statuses.iter().filter(|s| s.code() == Code::OverLimit).count();
        let overall = if over > 0 { Code::OverLimit } else { Code::Ok };
        debug!(
            hits = hits,
            over_limit = over,
            overall = ?overall,
            "Counted batch"
        );

        Ok(Response::new(RateLimitResponse {
            overall_code: overall.into(),
            statuses,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting::CounterStore;
    use crate::grpc::proto::{rate_limit_descriptor::Entry, RateLimit, RateLimitDescriptor};
    use std::time::Duration;

    fn descriptor(key: &str, value: &str, requests: u32) -> RateLimitDescriptor {
        RateLimitDescriptor {
            entries: vec![Entry {
                key: key.to_string(),
                value: value.to_string(),
            }],
            limit: Some(RateLimit {
                requests_per_unit: requests,
                window: Some(crate::grpc::duration_to_proto(Duration::from_secs(60))),
                name: String::new(),
            }),
        }
    }

    fn service() -> RateLimitServiceImpl<CounterStore> {
        RateLimitServiceImpl::new(Arc::new(CounterStore::new()))
    }

    #[tokio::test]
    async fn test_rejects_empty_domain() {
        let request = Request::new(RateLimitRequest {
            domain: String::new(),
            descriptors: vec![descriptor("user", "alice", 10)],
            hits_addend: 1,
        });

        let result = service().should_rate_limit(request).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_rejects_empty_batch() {
        let request = Request::new(RateLimitRequest {
            domain: "mesh".to_string(),
            descriptors: vec![],
            hits_addend: 1,
        });

        let result = service().should_rate_limit(request).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_descriptor_without_limit_rejected() {
        let mut bare = descriptor("user", "alice", 10);
        bare.limit = None;
        let request = Request::new(RateLimitRequest {
            domain: "mesh".to_string(),
            descriptors: vec![bare],
            hits_addend: 1,
        });

        let result = service().should_rate_limit(request).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_counts_valid_request() {
        let request = Request::new(RateLimitRequest {
            domain: "mesh".to_string(),
            descriptors: vec![descriptor("route", "/api", 10)],
            hits_addend: 1,
        });

        let response = service().should_rate_limit(request).await.unwrap().into_inner();
        assert_eq!(response.overall_code, i32::from(Code::Ok));
        assert_eq!(response.statuses.len(), 1);
        assert_eq!(response.statuses[0].limit_remaining, 9);
    }

    #[tokio::test]
    async fn test_one_over_limit_descriptor_sets_overall_code() {
        let service = service();
        let request = || {
            Request::new(RateLimitRequest {
                domain: "mesh".to_string(),
                descriptors: vec![descriptor("a", "1", 1), descriptor("b", "2", 100)],
                hits_addend: 0,
            })
        };

        service.should_rate_limit(request()).await.unwrap();
        let response = service.should_rate_limit(request()).await.unwrap().into_inner();

        assert_eq!(response.overall_code, i32::from(Code::OverLimit));
        assert_eq!(response.statuses[0].code(), Code::OverLimit);
        assert_eq!(response.statuses[1].code(), Code::Ok);
    }
}
