//! # EsoxSolutions.ServicePool
//!
//! Keyed, reference-counted pool for expensive stateful services
//! (connections, clients, handles) with sliding TTL expiry.
//!
//! ## Features
//!
//! - One shared instance per key, created on first use
//! - Concurrent first requests for a key share a single factory call
//! - Reference counting through `get`/`put`
//! - Per-entry monitor that evicts and closes idle services after a TTL
//! - Forced eviction with `del`
//! - Pool shutdown closes every resident service
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_servicepool::{ServicePool, StatefulService};
//!
//! struct Session(u32);
//!
//! impl StatefulService for Session {
//!     fn close(&self) {
//!         println!("closing session {}", self.0);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool: ServicePool<u32, Session> = ServicePool::with_defaults(|id: &u32| Session(*id)).unwrap();
//!
//!     let session = pool.get(&7).unwrap();
//!     println!("Got session {}", session.0);
//!     pool.put(&7, session).unwrap();
//!
//!     // Closed after ten idle minutes, or right away on shutdown
//!     pool.shutdown().await;
//! }
//! ```

mod pool;
mod config;
mod entry;
mod monitor;
mod traits;
mod errors;

pub use pool::ServicePool;
pub use config::{EntryConfig, PoolConfiguration, DEFAULT_TIME_TO_LIVE, MIN_REFRESH_INTERVAL};
pub use traits::{ServiceFactory, StatefulService};
pub use errors::{PoolError, PoolResult};
