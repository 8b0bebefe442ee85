//! EC2 realization of the cloud driver.
//!
//! One method per capability, each a thin sequence of SDK calls plus a
//! bounded wait where the resource has a state to settle into. Removal
//! operations treat "not found" as success so teardown can be re-run.

use crate::aws::context::AwsContext;
use crate::aws::error::classify_sdk_error;
use crate::driver::{CloudDriver, InstanceEndpoint, InstanceLaunchSpec};
use crate::record::{
    BootReport, CpuArch, Instance, InstanceTypeInfo, InstanceVolume, KeyPair, MachineImage,
    NetworkInterface, SecurityGroup,
};
use crate::wait::{wait_for_resource, WaitConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::types::{
    ArchitectureType, Filter, InstanceNetworkInterfaceSpecification, InstanceStateName,
    IpPermission, IpRange, ResourceType, SnapshotState, Tag, TagSpecification, VolumeState,
};
use aws_sdk_ec2::Client;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Canonical's AWS account, owner of the official Ubuntu images.
const UBUNTU_IMAGE_OWNER: &str = "099720109477";

/// Maximum wait for an instance state transition (running/stopped/terminated)
const INSTANCE_WAIT: Duration = Duration::from_secs(600);
/// Maximum wait for a snapshot to complete
const SNAPSHOT_WAIT: Duration = Duration::from_secs(900);
/// Maximum wait for a volume state transition
const VOLUME_WAIT: Duration = Duration::from_secs(300);
/// Maximum wait for the agent port to accept connections
const REACHABLE_WAIT: Duration = Duration::from_secs(300);
/// Maximum wait for the boot report to show up in the console output
const BOOT_REPORT_WAIT: Duration = Duration::from_secs(600);

const HOST_KEYS_BEGIN: &str = "-----BEGIN SSH HOST KEY KEYS-----";
const HOST_KEYS_END: &str = "-----END SSH HOST KEY KEYS-----";

/// EC2 driver for one environment's infrastructure.
pub struct Ec2Driver {
    client: Client,
}

impl Ec2Driver {
    /// Create a new EC2 driver (loads AWS config from the environment).
    pub async fn new(region: &str) -> Self {
        let ctx = AwsContext::new(region).await;
        Self::from_context(&ctx)
    }

    /// Create an EC2 driver from a pre-loaded AWS context.
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.ec2_client(),
        }
    }

    fn name_tags(resource_type: ResourceType, name: &str) -> TagSpecification {
        TagSpecification::builder()
            .resource_type(resource_type)
            .tags(Tag::builder().key("Name").value(name).build())
            .build()
    }

    /// Describe a single instance; `Ok(None)` when it no longer exists.
    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<aws_sdk_ec2::types::Instance>> {
        let response = match self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    return Ok(None);
                }
                return Err(anyhow::Error::from(e)).context("Failed to describe instance");
            }
        };

        Ok(response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .cloned())
    }

    async fn instance_state(&self, instance_id: &str) -> Result<Option<InstanceStateName>> {
        let instance = self.describe_instance(instance_id).await?;
        Ok(instance.and_then(|i| i.state().and_then(|s| s.name().cloned())))
    }

    /// Wait for an instance to be running, failing fast when it lands in a
    /// state it cannot leave towards running.
    async fn wait_for_running(&self, instance_id: &str) -> Result<()> {
        wait_for_resource(
            WaitConfig::with_timeout(INSTANCE_WAIT),
            || async {
                match self.instance_state(instance_id).await? {
                    Some(InstanceStateName::Running) => Ok(true),
                    Some(InstanceStateName::ShuttingDown) | Some(InstanceStateName::Terminated) => {
                        anyhow::bail!("Instance {} is terminating, it will never run", instance_id)
                    }
                    None => anyhow::bail!("Instance {} no longer exists", instance_id),
                    _ => Ok(false),
                }
            },
            &format!("instance {} running", instance_id),
        )
        .await
    }

    async fn wait_for_stopped(&self, instance_id: &str) -> Result<()> {
        wait_for_resource(
            WaitConfig::with_timeout(INSTANCE_WAIT),
            || async {
                match self.instance_state(instance_id).await? {
                    Some(InstanceStateName::Stopped) => Ok(true),
                    Some(InstanceStateName::ShuttingDown) | Some(InstanceStateName::Terminated) => {
                        anyhow::bail!("Instance {} terminated while stopping", instance_id)
                    }
                    None => anyhow::bail!("Instance {} no longer exists", instance_id),
                    _ => Ok(false),
                }
            },
            &format!("instance {} stopped", instance_id),
        )
        .await
    }

    async fn wait_for_terminated(&self, instance_id: &str) -> Result<()> {
        wait_for_resource(
            WaitConfig::with_timeout(INSTANCE_WAIT),
            || async {
                match self.instance_state(instance_id).await? {
                    Some(InstanceStateName::Terminated) | None => Ok(true),
                    _ => Ok(false),
                }
            },
            &format!("instance {} terminated", instance_id),
        )
        .await
    }

    async fn volume_state(&self, volume_id: &str) -> Result<Option<VolumeState>> {
        let response = match self
            .client
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    return Ok(None);
                }
                return Err(anyhow::Error::from(e)).context("Failed to describe volume");
            }
        };

        Ok(response.volumes().first().and_then(|v| v.state().cloned()))
    }

    async fn wait_for_volume_state(&self, volume_id: &str, desired: VolumeState) -> Result<()> {
        wait_for_resource(
            WaitConfig::with_timeout(VOLUME_WAIT),
            || async {
                match self.volume_state(volume_id).await? {
                    Some(state) if state == desired => Ok(true),
                    Some(VolumeState::Error) => {
                        anyhow::bail!("Volume {} entered the error state", volume_id)
                    }
                    None => anyhow::bail!("Volume {} no longer exists", volume_id),
                    _ => Ok(false),
                }
            },
            &format!("volume {} {:?}", volume_id, desired),
        )
        .await
    }

    /// Fetch and decode the instance console output.
    async fn console_output(&self, instance_id: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get_console_output()
            .instance_id(instance_id)
            .send()
            .await
            .context("Failed to get console output")?;

        if let Some(encoded) = response.output() {
            use base64::Engine;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            Ok(decoded)
        } else {
            Ok(None)
        }
    }
}

/// Extract the SSH host keys that cloud-init prints to the console between
/// its BEGIN/END markers. `None` until a non-empty block is present.
fn parse_host_keys(console: &str) -> Option<Vec<String>> {
    let begin = console.find(HOST_KEYS_BEGIN)?;
    let after_begin = begin + HOST_KEYS_BEGIN.len();
    let end = console[after_begin..].find(HOST_KEYS_END)? + after_begin;

    let keys: Vec<String> = console[after_begin..end]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if keys.is_empty() {
        return None;
    }
    Some(keys)
}

#[async_trait]
impl CloudDriver for Ec2Driver {
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: &str,
        ingress_port: u16,
    ) -> Result<SecurityGroup> {
        info!(name = %name, vpc_id = %vpc_id, "Creating security group");

        let response = self
            .client
            .create_security_group()
            .group_name(name)
            .description(description)
            .vpc_id(vpc_id)
            .tag_specifications(Self::name_tags(ResourceType::SecurityGroup, name))
            .send()
            .await
            .context("Failed to create security group")?;

        let group_id = response
            .group_id()
            .context("No security group ID in response")?
            .to_string();

        let permission = IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(i32::from(ingress_port))
            .to_port(i32::from(ingress_port))
            .ip_ranges(
                IpRange::builder()
                    .cidr_ip("0.0.0.0/0")
                    .description("Environment agent access")
                    .build(),
            )
            .build();

        self.client
            .authorize_security_group_ingress()
            .group_id(&group_id)
            .ip_permissions(permission)
            .send()
            .await
            .context("Failed to add ingress rule to security group")?;

        info!(sg_id = %group_id, port = ingress_port, "Security group created");

        Ok(SecurityGroup { id: group_id })
    }

    async fn remove_security_group(&self, security_group_id: &str) -> Result<()> {
        info!(sg_id = %security_group_id, "Removing security group");

        match self
            .client
            .delete_security_group()
            .group_id(security_group_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    debug!(sg_id = %security_group_id, "Security group already removed");
                    Ok(())
                } else {
                    Err(anyhow::Error::from(e)).context("Failed to delete security group")
                }
            }
        }
    }

    async fn create_key_pair(&self, name: &str) -> Result<KeyPair> {
        info!(name = %name, "Creating key pair");

        let response = self
            .client
            .create_key_pair()
            .key_name(name)
            .tag_specifications(Self::name_tags(ResourceType::KeyPair, name))
            .send()
            .await
            .context("Failed to create key pair")?;

        let id = response
            .key_pair_id()
            .context("No key pair ID in response")?
            .to_string();
        let private_key_pem = response
            .key_material()
            .context("No key material in response")?
            .to_string();

        Ok(KeyPair {
            id,
            name: name.to_string(),
            private_key_pem,
        })
    }

    async fn remove_key_pair(&self, key_pair_id: &str) -> Result<()> {
        info!(key_pair_id = %key_pair_id, "Removing key pair");

        match self
            .client
            .delete_key_pair()
            .key_pair_id(key_pair_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    debug!(key_pair_id = %key_pair_id, "Key pair already removed");
                    Ok(())
                } else {
                    Err(anyhow::Error::from(e)).context("Failed to delete key pair")
                }
            }
        }
    }

    async fn create_network_interface(
        &self,
        name: &str,
        description: &str,
        subnet_id: &str,
        security_group_ids: &[String],
    ) -> Result<NetworkInterface> {
        info!(name = %name, subnet_id = %subnet_id, "Creating network interface");

        let response = self
            .client
            .create_network_interface()
            .subnet_id(subnet_id)
            .description(description)
            .set_groups(Some(security_group_ids.to_vec()))
            .tag_specifications(Self::name_tags(ResourceType::NetworkInterface, name))
            .send()
            .await
            .context("Failed to create network interface")?;

        let id = response
            .network_interface()
            .and_then(|eni| eni.network_interface_id())
            .context("No network interface ID in response")?
            .to_string();

        Ok(NetworkInterface { id })
    }

    async fn remove_network_interface(&self, network_interface_id: &str) -> Result<()> {
        info!(eni_id = %network_interface_id, "Removing network interface");

        match self
            .client
            .delete_network_interface()
            .network_interface_id(network_interface_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    debug!(eni_id = %network_interface_id, "Network interface already removed");
                    Ok(())
                } else {
                    Err(anyhow::Error::from(e)).context("Failed to delete network interface")
                }
            }
        }
    }

    async fn lookup_instance_type(&self, requested: &str) -> Result<InstanceTypeInfo> {
        let instance_type: aws_sdk_ec2::types::InstanceType = requested
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid instance type: {}", requested))?;

        let response = self
            .client
            .describe_instance_types()
            .instance_types(instance_type)
            .send()
            .await
            .context("Failed to describe instance types")?;

        let info = response
            .instance_types()
            .first()
            .with_context(|| format!("Instance type {} not found", requested))?;

        let architectures = info
            .processor_info()
            .map(|p| p.supported_architectures())
            .unwrap_or_default();

        let arch = if architectures.contains(&ArchitectureType::Arm64) {
            CpuArch::Arm64
        } else {
            CpuArch::X86_64
        };

        debug!(instance_type = %requested, arch = %arch, "Resolved instance type");

        Ok(InstanceTypeInfo {
            name: requested.to_string(),
            arch,
        })
    }

    async fn lookup_image(&self, arch: CpuArch) -> Result<MachineImage> {
        let (name_pattern, arch_filter) = match arch {
            CpuArch::X86_64 => (
                "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*",
                "x86_64",
            ),
            CpuArch::Arm64 => (
                "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-arm64-server-*",
                "arm64",
            ),
        };

        let response = self
            .client
            .describe_images()
            .owners(UBUNTU_IMAGE_OWNER)
            .filters(Filter::builder().name("name").values(name_pattern).build())
            .filters(Filter::builder().name("state").values("available").build())
            .filters(
                Filter::builder()
                    .name("architecture")
                    .values(arch_filter)
                    .build(),
            )
            .send()
            .await
            .context("Failed to describe images")?;

        // Sort by creation date and get the latest
        let mut images: Vec<_> = response.images().iter().collect();
        images.sort_by(|a, b| {
            b.creation_date()
                .unwrap_or_default()
                .cmp(a.creation_date().unwrap_or_default())
        });

        let image = images
            .first()
            .with_context(|| format!("No Ubuntu image found for {}", arch))?;

        let id = image.image_id().context("Image has no ID")?.to_string();
        let root_device_name = image
            .root_device_name()
            .context("Image has no root device name")?
            .to_string();

        debug!(ami = %id, arch = %arch, "Found Ubuntu image");

        Ok(MachineImage {
            id,
            root_device_name,
        })
    }

    async fn create_instance(&self, name: &str, launch: &InstanceLaunchSpec) -> Result<Instance> {
        info!(
            name = %name,
            ami = %launch.image_id,
            instance_type = %launch.instance_type,
            "Launching instance"
        );

        let instance_type: aws_sdk_ec2::types::InstanceType = launch
            .instance_type
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid instance type: {}", launch.instance_type))?;

        let response = self
            .client
            .run_instances()
            .image_id(&launch.image_id)
            .instance_type(instance_type)
            .min_count(1)
            .max_count(1)
            .key_name(&launch.key_pair_name)
            .network_interfaces(
                InstanceNetworkInterfaceSpecification::builder()
                    .device_index(0)
                    .network_interface_id(&launch.network_interface_id)
                    .build(),
            )
            .tag_specifications(Self::name_tags(ResourceType::Instance, name))
            .send()
            .await
            .context("Failed to launch instance")?;

        let instance_id = response
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .context("No instance ID in response")?
            .to_string();

        info!(instance_id = %instance_id, "Instance launched, waiting until running");
        self.wait_for_running(&instance_id).await?;

        let instance = self
            .describe_instance(&instance_id)
            .await?
            .with_context(|| format!("Instance {} disappeared after launch", instance_id))?;

        let public_ip_address = instance.public_ip_address().map(str::to_string);
        let public_hostname = instance
            .public_dns_name()
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let volumes = instance
            .block_device_mappings()
            .iter()
            .filter_map(|mapping| {
                let device_name = mapping.device_name()?.to_string();
                let volume_id = mapping.ebs().and_then(|ebs| ebs.volume_id()).map(str::to_string);
                Some(InstanceVolume {
                    device_name,
                    volume_id,
                    snapshot_id: None,
                })
            })
            .collect();

        info!(instance_id = %instance_id, public_ip = ?public_ip_address, "Instance is running");

        Ok(Instance {
            id: instance_id,
            public_ip_address,
            public_hostname,
            volumes,
            boot_report: None,
        })
    }

    async fn start_instance(&self, instance_id: &str) -> Result<InstanceEndpoint> {
        info!(instance_id = %instance_id, "Starting instance");

        self.client
            .start_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .context("Failed to start instance")?;

        self.wait_for_running(instance_id).await?;

        let instance = self
            .describe_instance(instance_id)
            .await?
            .with_context(|| format!("Instance {} disappeared after start", instance_id))?;

        let public_ip_address = instance
            .public_ip_address()
            .with_context(|| format!("Instance {} has no public address", instance_id))?
            .to_string();
        let public_hostname = instance
            .public_dns_name()
            .filter(|name| !name.is_empty())
            .with_context(|| format!("Instance {} has no public hostname", instance_id))?
            .to_string();

        info!(instance_id = %instance_id, public_ip = %public_ip_address, "Instance is running");

        Ok(InstanceEndpoint {
            public_ip_address,
            public_hostname,
        })
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        info!(instance_id = %instance_id, "Stopping instance");

        self.client
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .context("Failed to stop instance")?;

        self.wait_for_stopped(instance_id).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        info!(instance_id = %instance_id, "Terminating instance");

        match self
            .client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    debug!(instance_id = %instance_id, "Instance already terminated");
                    return Ok(());
                }
                return Err(anyhow::Error::from(e)).context("Failed to terminate instance");
            }
        }

        self.wait_for_terminated(instance_id).await
    }

    async fn create_snapshot(&self, name: &str, volume_id: &str) -> Result<String> {
        info!(name = %name, volume_id = %volume_id, "Creating snapshot");

        let response = self
            .client
            .create_snapshot()
            .volume_id(volume_id)
            .tag_specifications(Self::name_tags(ResourceType::Snapshot, name))
            .send()
            .await
            .context("Failed to create snapshot")?;

        let snapshot_id = response
            .snapshot_id()
            .context("No snapshot ID in response")?
            .to_string();

        wait_for_resource(
            WaitConfig::with_timeout(SNAPSHOT_WAIT),
            || async {
                let response = self
                    .client
                    .describe_snapshots()
                    .snapshot_ids(&snapshot_id)
                    .send()
                    .await
                    .context("Failed to describe snapshot")?;

                match response.snapshots().first().and_then(|s| s.state()) {
                    Some(SnapshotState::Completed) => Ok(true),
                    Some(SnapshotState::Error) => {
                        anyhow::bail!("Snapshot {} entered the error state", snapshot_id)
                    }
                    _ => Ok(false),
                }
            },
            &format!("snapshot {} completed", snapshot_id),
        )
        .await?;

        info!(snapshot_id = %snapshot_id, "Snapshot completed");

        Ok(snapshot_id)
    }

    async fn remove_snapshot(&self, snapshot_id: &str) -> Result<()> {
        info!(snapshot_id = %snapshot_id, "Removing snapshot");

        match self
            .client
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    debug!(snapshot_id = %snapshot_id, "Snapshot already removed");
                    Ok(())
                } else {
                    Err(anyhow::Error::from(e)).context("Failed to delete snapshot")
                }
            }
        }
    }

    async fn create_volume_from_snapshot(
        &self,
        name: &str,
        availability_zone: &str,
        snapshot_id: &str,
    ) -> Result<String> {
        info!(
            name = %name,
            snapshot_id = %snapshot_id,
            availability_zone = %availability_zone,
            "Creating volume from snapshot"
        );

        let response = self
            .client
            .create_volume()
            .snapshot_id(snapshot_id)
            .availability_zone(availability_zone)
            .tag_specifications(Self::name_tags(ResourceType::Volume, name))
            .send()
            .await
            .context("Failed to create volume")?;

        let volume_id = response
            .volume_id()
            .context("No volume ID in response")?
            .to_string();

        self.wait_for_volume_state(&volume_id, VolumeState::Available)
            .await?;

        info!(volume_id = %volume_id, "Volume available");

        Ok(volume_id)
    }

    async fn attach_volume(
        &self,
        instance_id: &str,
        volume_id: &str,
        device_name: &str,
    ) -> Result<()> {
        info!(
            instance_id = %instance_id,
            volume_id = %volume_id,
            device = %device_name,
            "Attaching volume"
        );

        self.client
            .attach_volume()
            .instance_id(instance_id)
            .volume_id(volume_id)
            .device(device_name)
            .send()
            .await
            .context("Failed to attach volume")?;

        self.wait_for_volume_state(volume_id, VolumeState::InUse)
            .await
    }

    async fn detach_volume(
        &self,
        instance_id: &str,
        volume_id: &str,
        device_name: &str,
    ) -> Result<()> {
        info!(
            instance_id = %instance_id,
            volume_id = %volume_id,
            device = %device_name,
            "Detaching volume"
        );

        self.client
            .detach_volume()
            .instance_id(instance_id)
            .volume_id(volume_id)
            .device(device_name)
            .send()
            .await
            .context("Failed to detach volume")?;

        self.wait_for_volume_state(volume_id, VolumeState::Available)
            .await
    }

    async fn remove_volume(&self, volume_id: &str) -> Result<()> {
        info!(volume_id = %volume_id, "Removing volume");

        match self
            .client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    debug!(volume_id = %volume_id, "Volume already removed");
                    Ok(())
                } else {
                    Err(anyhow::Error::from(e)).context("Failed to delete volume")
                }
            }
        }
    }

    async fn wait_until_reachable(&self, address: &str, port: u16) -> Result<()> {
        let target = format!("{}:{}", address, port);
        info!(target = %target, "Waiting for the agent port to accept connections");

        wait_for_resource(
            WaitConfig::with_timeout(REACHABLE_WAIT),
            || {
                let target = target.clone();
                async move { Ok(tokio::net::TcpStream::connect(&target).await.is_ok()) }
            },
            &format!("agent at {}", target),
        )
        .await
    }

    async fn wait_for_boot_report(
        &self,
        instance_id: &str,
        address: &str,
        port: u16,
    ) -> Result<BootReport> {
        self.wait_until_reachable(address, port).await?;

        info!(instance_id = %instance_id, "Waiting for the boot report in the console output");

        let found: Mutex<Option<BootReport>> = Mutex::new(None);
        wait_for_resource(
            WaitConfig::with_timeout(BOOT_REPORT_WAIT),
            || async {
                let console = self.console_output(instance_id).await?;
                if let Some(keys) = console.as_deref().and_then(parse_host_keys) {
                    *found.lock().unwrap() = Some(BootReport { host_keys: keys });
                    return Ok(true);
                }
                Ok(false)
            },
            &format!("boot report of {}", instance_id),
        )
        .await?;

        found
            .into_inner()
            .ok()
            .flatten()
            .ok_or_else(|| anyhow::anyhow!("Boot report missing after successful wait"))
    }
}
