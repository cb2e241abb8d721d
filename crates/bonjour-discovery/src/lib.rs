//! DNS-SD service discovery and advertisement.
//!
//! This crate is the concurrency layer between callers and a platform
//! discovery driver:
//! - Many subscribers of one service type share a single driver session
//!   (exactly one start and one stop call per session)
//! - Found services are resolved one at a time through a bounded backlog
//! - The driver's expensive handle is created lazily, shared, and closed off
//!   the caller's thread once nobody uses it
//!
//! # Architecture
//!
//! 1. [`Bonjour::start_discovery`] validates the type and subscribes to the
//!    session for it, creating the session if needed
//! 2. The session's pump task acquires the shared handle from the
//!    [`SharedResourceGuard`] and starts the [`Driver`]
//! 3. Driver callbacks flow through a channel into the pump; found services go
//!    through the [`ResolveBacklog`], lost services are broadcast immediately
//! 4. Dropping the last [`DiscoveryStream`] stops the driver, stops the backlog
//!    and releases the handle
//!
//! Two drivers are provided: [`MdnsDriver`] (the embedded `mdns-sd`
//! responder) and [`MemoryDriver`] (an in-process network for tests).
//!
//! # Example
//!
//! ```no_run
//! use bonjour_core::DiscoveryConfig;
//! use bonjour_discovery::{Bonjour, MemoryDriver};
//! use futures::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bonjour = Bonjour::new(MemoryDriver::new(), DiscoveryConfig::default());
//!     let context = CancellationToken::new();
//!
//!     let mut events = bonjour.start_discovery("_http._tcp", &context)?;
//!     if let Some(event) = events.next().await {
//!         println!("{}", event?.service());
//!     }
//!
//!     drop(events);
//!     bonjour.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backlog;
pub mod bonjour;
pub mod driver;
pub mod drivers;
pub mod guard;
pub mod metrics;
pub mod session;
pub mod stream;

pub use backlog::{BacklogPhase, ResolveBacklog};
pub use bonjour::{Bonjour, Broadcast};
pub use driver::{Driver, DriverSink, HandleContext, Permit, ResolveReply};
pub use drivers::{MdnsDriver, MemoryDriver};
pub use guard::{HandleLease, SharedResourceGuard};
pub use metrics::DiscoveryMetrics;
pub use session::{DiscoverySession, SessionKey};
pub use stream::DiscoveryStream;

pub use bonjour_core::{is_valid_service_type, DiscoveryError, DiscoveryEvent, ServiceRecord};
