//! # svcproxy-agent
//!
//! Node-local service proxy. Watches services, endpoint slices and the local
//! node, and keeps an nftables table in sync so that traffic to a service
//! address reaches one of its backends.
//!
//! ## Pipeline
//!
//! - [`events`]: typed change events, applied in order by one task
//! - [`service`], [`endpoints`]: change trackers and the materialized maps
//! - [`topology`]: traffic-policy and topology endpoint selection
//! - [`proxier`]: the sync pass and rule generation
//! - [`backend`]: atomic transaction application (`nft` or in-memory)
//! - [`conntrack`]: UDP connection-tracking cleanup after a pass
//!
//! Syncs are rate limited by [`svcproxy_reconcile::SyncRunner`].

pub mod backend;
pub mod config;
pub mod conntrack;
pub mod endpoints;
mod error;
pub mod events;
pub mod feed;
pub mod health;
pub mod metrics;
pub mod proxier;
pub mod rules;
pub mod service;
pub mod slice_cache;
pub mod topology;

pub use error::ProxyError;
pub use events::ProxyEvent;
pub use proxier::{Proxier, ProxierConfig, SyncOutcome};
