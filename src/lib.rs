//! # netcollect - Router Fleet State Collection
//!
//! `netcollect` collects operational state from fleets of IOS, IOS-XE and
//! IOS-XR routers over SSH. Every device is reached through a single jump
//! host, commands are grouped into functional layers (health, interfaces,
//! IGP, MPLS, BGP, VPN, static routing, console), and each command's output
//! lands on disk as a raw artifact plus, when a parser recognizes it, a JSON
//! document.
//!
//! ## Features
//!
//! - **Jump Host Proxying**: One SSH transport to the bastion, one direct-tcpip channel per device session
//! - **Session Pooling**: Bounded pool of device shells with idle expiry and reuse across layers
//! - **Retry With Backoff**: Transport failures are retried, authentication failures never are
//! - **Concurrent Layers**: One task per (device, layer); failures stay contained to their task
//! - **Parsing Pipeline**: Structured parsers, then regex templates, then raw-only
//! - **Not-Configured Detection**: Versioned rule set tells absent features from failures
//! - **Atomic Artifacts**: Temp-file-and-rename writes, gzip above a size threshold
//! - **Session Recording**: JSONL transcripts that can be replayed offline
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use netcollect::config::CollectorConfig;
//! use netcollect::coordinator::{CollectionCoordinator, RunContext};
//! use netcollect::device::{CredentialStore, Credentials, Device};
//! use netcollect::session::{JumpHost, JumpHostConfig, SshConnector};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let jump = Arc::new(JumpHost::new(JumpHostConfig::new(
//!         "bastion.example.net",
//!         Credentials::new("collector", "bastion-secret"),
//!     )));
//!     let credentials = Arc::new(CredentialStore::new(
//!         Credentials::new("netops", "device-secret").with_enable_secret("enable-secret"),
//!     ));
//!     let connector = Arc::new(SshConnector::new(jump.clone(), credentials));
//!
//!     let context = RunContext::new(CollectorConfig::default(), connector)?;
//!     let coordinator = CollectionCoordinator::new(context);
//!
//!     let devices = vec![
//!         Device::new("pe1.lab", "10.0.0.1", Some("ios-xr")),
//!         Device::new("ce1.lab", "10.0.1.1", Some("ios-xe")),
//!     ];
//!     let run = coordinator.run(devices, CancellationToken::new()).await?;
//!     println!("{} {}: {:?}", run.run_id, run.status, run.stats);
//!
//!     jump.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`coordinator::CollectionCoordinator`] - Runs a collection and writes the summary
//! - [`executor::TaskExecutor`] - Bounded concurrent execution of layer tasks
//! - [`session::ConnectionManager`] - Session pool with retry and failure memo
//! - [`parsing::ParsingPipeline`] - Structured, template and raw-only interpretation
//! - [`output::OutputHandler`] - Run directory layout and atomic artifact writes
//! - [`catalog::CommandCatalog`] - Commands per platform and layer
//! - [`error::ConnectError`] - Error types for connection and command execution

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod executor;
pub mod output;
pub mod parsing;
pub mod prompt;
pub mod report;
pub mod session;
pub mod templates;

pub use catalog::{CommandCatalog, CommandSpec, Layer};
pub use config::CollectorConfig;
pub use coordinator::{CollectionCoordinator, RunContext};
pub use device::{CredentialStore, Credentials, Device, Platform};
pub use error::{CollectError, ConnectError, FailureKind};
pub use report::{CollectionRun, RunStatus, RunSummary, metadata_schema};
