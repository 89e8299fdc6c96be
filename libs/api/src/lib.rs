//! # svcproxy-api
//!
//! Object model for the state the service proxy watches.
//!
//! ## Objects
//!
//! - [`Service`]: a stable virtual address with one or more ports
//! - [`EndpointSlice`]: a partial list of backends for one service
//! - [`Node`]: the node the proxy runs on (only its labels matter)
//!
//! ## Watch events
//!
//! Changes arrive as [`WatchEvent`]s, one JSON document per line, typed by
//! `event_type` (`service.added`, `endpointslice.deleted`, ...). The
//! `*.synced` events mark the end of an initial listing.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::ApiError;
pub use types::*;
