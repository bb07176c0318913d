//! Collaborator Ports
//!
//! Interfaces the replication core consumes. The core never owns replicated
//! data; each data domain plugs in its own store, transport and retry policy.

mod failure_policy;
mod member_directory;
mod record_store;
mod transport_agent;

pub use failure_policy::{DelayedRetryPolicy, FailurePolicy, RetryDecision};
pub use member_directory::{Member, MemberDirectory, MemberState};
pub use record_store::RecordStore;
pub use transport_agent::TransportAgent;
