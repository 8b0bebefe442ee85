//! devenv-ec2 - EC2 infrastructure backend for isolated development environments
//!
//! This crate provisions, persists, restores, and tears down the AWS
//! infrastructure backing a single development environment (an EC2 instance
//! plus its security group, key pair, network interface, and block-storage
//! volumes) on behalf of a higher-level environment-management tool.
//!
//! ## Core pieces
//!
//! - [`queue`]: the resumable provisioning engine, ordered groups of
//!   idempotent steps over a partially-built [`record::InfraRecord`]
//! - [`volumes`]: the concurrent volume lifecycle coordinator, per-volume
//!   snapshot/restore workflows fanned out and joined deterministically
//! - [`orchestrator`]: the environment lifecycle operations
//!   (create/start/stop/remove/save-data/restore-data) composed from the above
//!
//! The cloud itself is reached through the [`driver::CloudDriver`] and
//! [`config_store::ConfigStore`] seams; the [`aws`] module provides the
//! EC2/DynamoDB implementations. Progress narration goes through the
//! [`progress::ProgressReporter`] seam so the host tool owns all rendering.
//!
//! The crate never persists anything itself: every operation mutates the
//! caller's record in place, and the caller must re-persist the record after
//! every call, success or failure. That is the entire resumability contract.

pub mod aws;
pub mod config_store;
pub mod driver;
pub mod naming;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod record;
pub mod testing;
pub mod volumes;
pub mod wait;

pub use config_store::{ConfigRecord, ConfigStore, ConfigStoreError, ConfigStoreGuard};
pub use driver::CloudDriver;
pub use orchestrator::{ClusterNetwork, EnvironmentService, EnvironmentSpec};
pub use progress::{LogReporter, ProgressReporter};
pub use record::InfraRecord;
