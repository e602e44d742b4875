//! Sheet service interface
//!
//! The engine depends on a small capability set ([`client::SheetClient`]),
//! not a specific vendor API. The HTTP implementation and the shared token
//! bucket live here; the mock implementation backs the integration tests.

pub mod client;
pub mod http;
pub mod mock;
pub mod rate_limit;

pub use client::{RateLimitedSheet, SheetClient, SheetPage, SheetRecord};
pub use http::HttpSheetClient;
pub use mock::MockSheetClient;
pub use rate_limit::TokenBucket;
