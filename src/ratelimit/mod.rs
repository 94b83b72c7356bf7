//! Rate limiting logic: descriptor matching, local buckets, the global
//! client and verdict merging.

mod bucket;
mod clock;
mod descriptor;
mod global;
mod local;
mod matcher;
mod merger;
mod verdict;

pub use bucket::TokenBucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use descriptor::{Descriptor, DescriptorKey};
pub use global::{GlobalCheckError, GlobalLimitClient, GlobalLimiter};
pub use local::LocalBucketEngine;
pub use matcher::{match_request, MatchedDescriptor, RequestAttributes};
pub use merger::{merge, Decision, DecisionRecord, DenyResponse};
pub use verdict::{Outcome, Quota, RuleRef, Verdict};
