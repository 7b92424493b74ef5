//! Cinder - Graphite-family metrics ingestion and aggregation relay.
//!
//! Cinder receives timestamped numeric samples over the plaintext carbon
//! line protocol (TCP and UDP), coalesces same-named samples in a bounded
//! in-memory cache, answers low-latency point lookups for a companion
//! rendering service, and hands whole-metric batches to a persister.
//!
//! # Architecture
//!
//! - `receiver`: TCP/UDP line-protocol listeners
//! - `cache`: the single-writer aggregation cache
//! - `persist`: the drain-side adapter
//! - `core`: domain types, errors and configuration
//! - `cli`: command-line interface and daemon wiring
//!
//! The cache worker is the only task that touches cache state; everything
//! else communicates with it over bounded channels. Under overload the
//! relay drops and counts rather than blocking the ingest path.
//!
//! # Example
//!
//! ```no_run
//! use cinder_lib::cache::{Cache, CacheSettings};
//! use cinder_lib::core::Points;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut cache = Cache::new(CacheSettings::default());
//!     let output = cache.take_output();
//!     cache.start();
//!
//!     let input = cache.input();
//!     input.send(Points::one_point("hello.world", 42.15, 1422698155)).await.ok();
//!
//!     let queries = cache.queries();
//!     let reply = queries.lookup("hello.world").await;
//!     println!("{:?}", reply);
//!     cache.stop().await;
//!     drop(output);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod cli;
pub mod core;
pub mod persist;
pub mod receiver;

pub use crate::cache::{Cache, CacheSettings, QueryHandle};
pub use crate::core::{CinderError, Config, Point, Points, Result};
