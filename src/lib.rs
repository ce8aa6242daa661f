//! flagkit: an in-process feature-flag SDK.
//!
//! The crate embeds a deterministic rule evaluator in the host application:
//! every `get_treatment` call is answered from a local cache of flag
//! definitions, without a network round-trip, with the same outcome a
//! server-side evaluation of the same rules would produce. Background tasks
//! keep that cache current — periodic pollers plus an optional streaming
//! channel — and bounded pipelines deliver impressions (evaluation
//! outcomes) and tracked events to the backend.
//!
//! ## Quick start
//!
//! ```ignore
//! use flagkit::{build_factory, SdkConfig};
//!
//! # async fn demo() -> Result<(), flagkit::SdkError> {
//! let factory = build_factory("YOUR_SDK_KEY", SdkConfig::default()).await?;
//! factory.block_until_ready(5_000).await?;
//!
//! let client = factory.client();
//! match client.get_treatment("user-42", "new_checkout", None).as_str() {
//!     "on" => { /* feature path */ }
//!     "off" => { /* default path */ }
//!     _ => { /* control: be conservative */ }
//! }
//!
//! client.track("user-42", "user", "checkout.completed", Some(79.99), None);
//! factory.destroy().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Offline development
//!
//! Building a factory with the api key `"localhost"` performs no network
//! I/O: flags come from `$HOME/.split` (or `SdkConfig::localhost_file`),
//! in plain `feature treatment` lines, YAML whitelist entries, or full JSON
//! definitions. The file is re-read whenever its mtime changes.
//!
//! ## Guarantees
//!
//! No public call panics or surfaces an error: invalid input, unknown
//! flags, a not-yet-ready SDK, and a destroyed factory all degrade to the
//! `"control"` treatment with a descriptive label. Telemetry delivery is
//! bounded and lossy by design — evaluation throughput is never traded for
//! it.

pub mod config;
pub mod error;

mod client;
mod evaluator;
mod events;
mod factory;
mod hashing;
mod impressions;
mod localhost;
mod matchers;
mod splitter;
pub mod storage;
mod sync;
mod telemetry;
pub mod types;

pub use client::{SplitClient, SplitManager, TreatmentWithConfig};
pub use config::SdkConfig;
pub use error::{Result, SdkError};
pub use factory::{build_factory, SplitFactory, LOCALHOST_API_KEY};
pub use impressions::{ImpressionListener, ImpressionsMode};
pub use types::{Attributes, Event, Impression, Key, SplitView, CONTROL};
