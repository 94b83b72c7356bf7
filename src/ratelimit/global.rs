//! Client for the shared counting service.
//!
//! All global descriptors of a request travel in one batched call. The call
//! has a single deadline covering the wait for an in-flight slot, the call
//! itself and at most one retry.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, trace, warn};

use super::matcher::MatchedDescriptor;
use super::verdict::{Quota, Verdict};
use crate::config::GlobalClientConfig;
use crate::error::{MeshguardError, Result};
use crate::grpc::proto::rate_limit_response::{Code, DescriptorStatus};
use crate::grpc::proto::{RateLimit, RateLimitDescriptor, RateLimitRequest, RateLimitResponse};
use crate::grpc::{duration_from_proto, duration_to_proto, RateLimitServiceClient};

/// Why a global check produced no definite verdict.
#[derive(Debug, Error)]
pub enum GlobalCheckError {
    #[error("global check exceeded its deadline")]
    Timeout,

    #[error("no in-flight slot became free before the deadline")]
    PoolExhausted,

    #[error("counting service returned an error: {0}")]
    Status(#[from] tonic::Status),

    #[error("malformed counting service response: {0}")]
    Malformed(String),

    #[error("no counting service endpoint is configured")]
    NotConfigured,
}

/// A strategy that checks a batch of descriptors against shared counts.
#[async_trait]
pub trait GlobalLimiter: Send + Sync {
    /// Check every descriptor in `batch` with one call. Any over-limit
    /// descriptor denies the whole batch.
    async fn check(
        &self,
        domain: &str,
        batch: &[MatchedDescriptor],
    ) -> std::result::Result<Verdict, GlobalCheckError>;
}

/// gRPC client for the counting service.
///
/// Cloning the underlying channel is cheap; every clone multiplexes over the
/// same connection.
#[derive(Clone)]
pub struct GlobalLimitClient {
    client: RateLimitServiceClient<Channel>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    retry: bool,
}

impl GlobalLimitClient {
    /// Build a lazily connecting client. Must be called within a Tokio runtime.
    pub fn new(config: &GlobalClientConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| MeshguardError::Config("global.endpoint is not set".to_string()))?;

        let channel = Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(config.connect_timeout())
            .connect_lazy();

        debug!(endpoint = %endpoint, "Created global limit client");
        Ok(Self::with_channel(channel, config))
    }

    /// Build a client over an existing channel.
    pub fn with_channel(channel: Channel, config: &GlobalClientConfig) -> Self {
        Self {
            client: RateLimitServiceClient::new(channel),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            timeout: config.timeout(),
            retry: config.retry,
        }
    }

    async fn call(
        &self,
        request: &RateLimitRequest,
        deadline: Instant,
    ) -> std::result::Result<RateLimitResponse, GlobalCheckError> {
        let mut client = self.client.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GlobalCheckError::Timeout);
            }

            let mut req = tonic::Request::new(request.clone());
            req.set_timeout(remaining);

            match timeout_at(deadline, client.should_rate_limit(req)).await {
                Err(_) => return Err(GlobalCheckError::Timeout),
                Ok(Ok(response)) => return Ok(response.into_inner()),
                Ok(Err(status)) => {
                    let retryable = status.code() == tonic::Code::Unavailable;
                    if self.retry && retryable && attempt == 1 {
                        debug!(error = %status, "Retrying global check on the remaining budget");
                        continue;
                    }
                    if status.code() == tonic::Code::DeadlineExceeded {
                        return Err(GlobalCheckError::Timeout);
                    }
                    return Err(GlobalCheckError::Status(status));
                }
            }
        }
    }
}

#[async_trait]
impl GlobalLimiter for GlobalLimitClient {
    async fn check(
        &self,
        domain: &str,
        batch: &[MatchedDescriptor],
    ) -> std::result::Result<Verdict, GlobalCheckError> {
        if batch.is_empty() {
            return Ok(Verdict::admit());
        }

        let deadline = Instant::now() + self.timeout;
        let _permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => match timeout_at(deadline, self.permits.acquire()).await {
                Ok(Ok(permit)) => permit,
                _ => return Err(GlobalCheckError::PoolExhausted),
            },
        };

        let request = build_request(domain, batch);
        trace!(
            domain = %domain,
            descriptors = batch.len(),
            budget_ms = self.timeout.as_millis() as u64,
            "Sending global check"
        );

        let response = self.call(&request, deadline).await.map_err(|e| {
            warn!(domain = %domain, error = %e, "Global check failed");
            e
        })?;
        interpret(batch, &response)
    }
}

fn build_request(domain: &str, batch: &[MatchedDescriptor]) -> RateLimitRequest {
    let descriptors = batch
        .iter()
        .map(|m| RateLimitDescriptor {
            entries: m.descriptor.to_proto_entries(),
            limit: Some(RateLimit {
                // Bounded to u32 when the policy was validated
                requests_per_unit: u32::try_from(m.limit.requests).unwrap_or(u32::MAX),
                window: Some(duration_to_proto(m.limit.window)),
                name: m.rule.name.clone().unwrap_or_default(),
            }),
        })
        .collect();

    RateLimitRequest {
        domain: domain.to_string(),
        descriptors,
        hits_addend: 1,
    }
}

/// Turn a response into a verdict for the whole batch.
fn interpret(
    batch: &[MatchedDescriptor],
    response: &RateLimitResponse,
) -> std::result::Result<Verdict, GlobalCheckError> {
    if response.statuses.len() != batch.len() {
        return Err(GlobalCheckError::Malformed(format!(
            "expected {} statuses, got {}",
            batch.len(),
            response.statuses.len()
        )));
    }

    let mut over_limit = false;
    let mut retry_after: Option<Duration> = None;
    let mut tightest: Option<Quota> = None;

    for (matched, status) in batch.iter().zip(&response.statuses) {
        match Code::try_from(status.code) {
            Ok(Code::Ok) => {}
            Ok(Code::OverLimit) => {
                over_limit = true;
                if let Some(reset) = status.duration_until_reset.as_ref().map(duration_from_proto) {
                    retry_after = Some(retry_after.map_or(reset, |r| r.max(reset)));
                }
            }
            _ => {
                return Err(GlobalCheckError::Malformed(format!(
                    "status code {} for descriptor {}",
                    status.code, matched.descriptor
                )));
            }
        }

        let quota = quota_for(matched, status);
        if tightest.map_or(true, |q| quota.remaining < q.remaining) {
            tightest = Some(quota);
        }
    }

    if response.overall_code() == Code::OverLimit {
        over_limit = true;
    }

    let verdict = if over_limit {
        Verdict::deny(retry_after)
    } else {
        Verdict::admit()
    };
    Ok(match tightest {
        Some(quota) => verdict.with_quota(quota),
        None => verdict,
    })
}

fn quota_for(matched: &MatchedDescriptor, status: &DescriptorStatus) -> Quota {
    Quota {
        limit: matched.limit.requests,
        window: matched.limit.window,
        remaining: status.limit_remaining as u64,
        reset_after: status
            .duration_until_reset
            .as_ref()
            .map(duration_from_proto)
            .unwrap_or_default(),
    }
}
