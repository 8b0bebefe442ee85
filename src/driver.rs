//! Cloud driver seam.
//!
//! One capability per resource kind, injected into the orchestrator as
//! `Arc<dyn CloudDriver>`. The EC2 implementation lives in [`crate::aws`];
//! tests use the mock in [`crate::testing`]. Keeping the whole surface behind
//! one trait means no process-wide SDK client state anywhere in the crate.
//!
//! Semantics the orchestrator relies on:
//!
//! - every `wait_*` and the waits embedded in create/start/stop/terminate are
//!   bounded; a timeout is an error, never a hang
//! - removal operations treat "not found" as success so teardown can be
//!   safely re-run
//! - no operation retries internally; retry policy belongs to the caller
//!   re-invoking a whole operation against the persisted record

use crate::record::{
    BootReport, CpuArch, Instance, InstanceTypeInfo, KeyPair, MachineImage, NetworkInterface,
    SecurityGroup,
};
use anyhow::Result;
use async_trait::async_trait;

/// Everything needed to launch the environment instance, read from record
/// fields populated by earlier provisioning steps.
#[derive(Debug, Clone)]
pub struct InstanceLaunchSpec {
    pub image_id: String,
    pub root_device_name: String,
    pub instance_type: String,
    pub network_interface_id: String,
    pub key_pair_name: String,
}

/// Fresh public addressing for an instance that just reached the running
/// state. Stopped instances lose their public addresses, so every start
/// produces a new endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEndpoint {
    pub public_ip_address: String,
    pub public_hostname: String,
}

/// Cloud operations consumed by the provisioning engine and the volume
/// coordinator, one method per capability.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: &str,
        ingress_port: u16,
    ) -> Result<SecurityGroup>;

    async fn remove_security_group(&self, security_group_id: &str) -> Result<()>;

    async fn create_key_pair(&self, name: &str) -> Result<KeyPair>;

    async fn remove_key_pair(&self, key_pair_id: &str) -> Result<()>;

    async fn create_network_interface(
        &self,
        name: &str,
        description: &str,
        subnet_id: &str,
        security_group_ids: &[String],
    ) -> Result<NetworkInterface>;

    async fn remove_network_interface(&self, network_interface_id: &str) -> Result<()>;

    /// Resolve the requested instance type to its concrete classification.
    async fn lookup_instance_type(&self, requested: &str) -> Result<InstanceTypeInfo>;

    /// Find the newest supported machine image for the given architecture.
    async fn lookup_image(&self, arch: CpuArch) -> Result<MachineImage>;

    /// Launch the instance, wait until it is running, and return it with its
    /// public addressing and discovered block-device attachments.
    async fn create_instance(&self, name: &str, launch: &InstanceLaunchSpec) -> Result<Instance>;

    /// Start a stopped instance and wait until it is running.
    async fn start_instance(&self, instance_id: &str) -> Result<InstanceEndpoint>;

    /// Stop a running instance and wait until it is stopped.
    async fn stop_instance(&self, instance_id: &str) -> Result<()>;

    /// Terminate the instance and wait until it is gone. An instance that no
    /// longer exists counts as terminated.
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    /// Snapshot a volume and wait for the snapshot to complete. Returns the
    /// snapshot id.
    async fn create_snapshot(&self, name: &str, volume_id: &str) -> Result<String>;

    async fn remove_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Create a volume from a snapshot in the given availability zone and
    /// wait for it to become available. Returns the volume id.
    async fn create_volume_from_snapshot(
        &self,
        name: &str,
        availability_zone: &str,
        snapshot_id: &str,
    ) -> Result<String>;

    /// Attach a volume at the given device name and wait for the attachment.
    async fn attach_volume(&self, instance_id: &str, volume_id: &str, device_name: &str)
        -> Result<()>;

    /// Detach a volume and wait until it is free.
    async fn detach_volume(&self, instance_id: &str, volume_id: &str, device_name: &str)
        -> Result<()>;

    async fn remove_volume(&self, volume_id: &str) -> Result<()>;

    /// Block until a TCP connection to `address:port` succeeds.
    async fn wait_until_reachable(&self, address: &str, port: u16) -> Result<()>;

    /// Block until the instance has finished its first boot and published its
    /// host identity keys, probing reachability of the agent port first.
    async fn wait_for_boot_report(
        &self,
        instance_id: &str,
        address: &str,
        port: u16,
    ) -> Result<BootReport>;
}
