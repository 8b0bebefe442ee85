//! Environment lifecycle orchestration.
//!
//! [`EnvironmentService`] implements the provider-side lifecycle contract for
//! one development environment: create, start, stop, remove, save-data, and
//! restore-data, plus the provider configuration storage operations. Each
//! operation works over the caller's [`InfraRecord`], mutating it in place so
//! the caller can re-persist it after every call regardless of outcome.
//!
//! Create and remove are expressed as provisioning queues of idempotent
//! steps; save and restore hand the instance's volume list to the concurrent
//! volume coordinator. All cloud access goes through the injected
//! [`CloudDriver`] and [`ConfigStore`].

use crate::config_store::{ConfigStore, ConfigStoreGuard};
use crate::driver::{CloudDriver, InstanceLaunchSpec};
use crate::naming::{env_resource_name, ResourceKind};
use crate::progress::ProgressReporter;
use crate::queue::{InfrastructureQueue, StepGroup};
use crate::record::InfraRecord;
use crate::volumes;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

const SECURITY_GROUP_DESCRIPTION: &str =
    "The security group attached to your development environment";
const NETWORK_INTERFACE_DESCRIPTION: &str =
    "The network interface attached to your development environment";

/// Cluster-level networking the environment plugs into, resolved by the host
/// tool before any environment operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNetwork {
    pub vpc_id: String,
    pub subnet_id: String,
    pub availability_zone: String,
}

/// Identity and placement of one environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub cluster_slug: String,
    pub env_slug: String,
    /// Requested instance type (e.g. "t3.medium"), resolved during create.
    pub instance_type: String,
    /// Port the in-instance environment agent listens on; opened in the
    /// security group and probed for reachability.
    pub agent_port: u16,
    pub network: ClusterNetwork,
}

impl EnvironmentSpec {
    fn resource_name(&self, kind: ResourceKind) -> String {
        env_resource_name(&self.cluster_slug, &self.env_slug, kind)
    }
}

/// The environment lifecycle operations for this provider.
pub struct EnvironmentService {
    driver: Arc<dyn CloudDriver>,
    config: ConfigStoreGuard,
}

impl EnvironmentService {
    pub fn new(driver: Arc<dyn CloudDriver>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            driver,
            config: ConfigStoreGuard::new(store),
        }
    }

    /// Build the environment's infrastructure.
    ///
    /// Safe to re-run after a partial failure: every step checks whether its
    /// target field is already populated and skips the cloud call if so, so
    /// only the remaining suffix of work executes.
    pub async fn create_env(
        &self,
        reporter: &dyn ProgressReporter,
        spec: &EnvironmentSpec,
        infra: &mut InfraRecord,
    ) -> Result<()> {
        info!(
            cluster = %spec.cluster_slug,
            env = %spec.env_slug,
            instance_type = %spec.instance_type,
            "Creating environment infrastructure"
        );

        let mut queue = InfrastructureQueue::new();

        queue.push(
            StepGroup::new("Creating a security group and a key pair")
                .step({
                    let driver = self.driver.clone();
                    let name = spec.resource_name(ResourceKind::SecurityGroup);
                    let vpc_id = spec.network.vpc_id.clone();
                    let agent_port = spec.agent_port;
                    move |infra: &mut InfraRecord| {
                        Box::pin(async move {
                            if infra.security_group.is_some() {
                                return Ok(());
                            }
                            let group = driver
                                .create_security_group(
                                    &name,
                                    SECURITY_GROUP_DESCRIPTION,
                                    &vpc_id,
                                    agent_port,
                                )
                                .await?;
                            infra.security_group = Some(group);
                            Ok(())
                        })
                    }
                })
                .step({
                    let driver = self.driver.clone();
                    let name = spec.resource_name(ResourceKind::KeyPair);
                    move |infra: &mut InfraRecord| {
                        Box::pin(async move {
                            if infra.key_pair.is_some() {
                                return Ok(());
                            }
                            let key_pair = driver.create_key_pair(&name).await?;
                            infra.key_pair = Some(key_pair);
                            Ok(())
                        })
                    }
                }),
        );

        queue.push(StepGroup::new("Creating a network interface").step({
            let driver = self.driver.clone();
            let name = spec.resource_name(ResourceKind::NetworkInterface);
            let subnet_id = spec.network.subnet_id.clone();
            move |infra: &mut InfraRecord| {
                Box::pin(async move {
                    if infra.network_interface.is_some() {
                        return Ok(());
                    }
                    let security_group = infra.security_group.as_ref().ok_or_else(|| {
                        anyhow::anyhow!("Security group must exist before the network interface")
                    })?;
                    let interface = driver
                        .create_network_interface(
                            &name,
                            NETWORK_INTERFACE_DESCRIPTION,
                            &subnet_id,
                            &[security_group.id.clone()],
                        )
                        .await?;
                    infra.network_interface = Some(interface);
                    Ok(())
                })
            }
        }));

        queue.push(StepGroup::new("Resolving the instance type").step({
            let driver = self.driver.clone();
            let requested = spec.instance_type.clone();
            move |infra: &mut InfraRecord| {
                Box::pin(async move {
                    if infra.instance_type.is_some() {
                        return Ok(());
                    }
                    let type_info = driver.lookup_instance_type(&requested).await?;
                    infra.instance_type = Some(type_info);
                    Ok(())
                })
            }
        }));

        queue.push(StepGroup::new("Resolving the machine image").step({
            let driver = self.driver.clone();
            move |infra: &mut InfraRecord| {
                Box::pin(async move {
                    if infra.image.is_some() {
                        return Ok(());
                    }
                    let type_info = infra.instance_type.as_ref().ok_or_else(|| {
                        anyhow::anyhow!("Instance type must be resolved before the image")
                    })?;
                    let image = driver.lookup_image(type_info.arch).await?;
                    infra.image = Some(image);
                    Ok(())
                })
            }
        }));

        queue.push(StepGroup::new("Creating the instance").step({
            let driver = self.driver.clone();
            let name = spec.resource_name(ResourceKind::Instance);
            move |infra: &mut InfraRecord| {
                Box::pin(async move {
                    if infra.instance.is_some() {
                        return Ok(());
                    }
                    let image = infra
                        .image
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("Image must be resolved before the instance"))?;
                    let type_info = infra.instance_type.as_ref().ok_or_else(|| {
                        anyhow::anyhow!("Instance type must be resolved before the instance")
                    })?;
                    let interface = infra.network_interface.as_ref().ok_or_else(|| {
                        anyhow::anyhow!("Network interface must exist before the instance")
                    })?;
                    let key_pair = infra
                        .key_pair
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("Key pair must exist before the instance"))?;

                    let launch = InstanceLaunchSpec {
                        image_id: image.id.clone(),
                        root_device_name: image.root_device_name.clone(),
                        instance_type: type_info.name.clone(),
                        network_interface_id: interface.id.clone(),
                        key_pair_name: key_pair.name.clone(),
                    };

                    let instance = driver.create_instance(&name, &launch).await?;
                    infra.instance = Some(instance);
                    Ok(())
                })
            }
        }));

        queue.push(StepGroup::new("Waiting for the environment to finish booting").step({
            let driver = self.driver.clone();
            let agent_port = spec.agent_port;
            move |infra: &mut InfraRecord| {
                Box::pin(async move {
                    let instance = infra
                        .instance
                        .as_mut()
                        .ok_or_else(|| anyhow::anyhow!("Instance must exist before boot wait"))?;
                    if instance.boot_report.is_some() {
                        return Ok(());
                    }
                    let address = instance.public_ip_address.clone().ok_or_else(|| {
                        anyhow::anyhow!("Instance {} has no public address", instance.id)
                    })?;
                    let report = driver
                        .wait_for_boot_report(&instance.id, &address, agent_port)
                        .await?;
                    instance.boot_report = Some(report);
                    Ok(())
                })
            }
        }));

        queue.run(infra, reporter).await
    }

    /// Tear the environment's infrastructure down, in reverse dependency
    /// order. Fields are nulled out once the underlying resource is confirmed
    /// removed, so a mid-teardown failure leaves a record that can be re-run.
    pub async fn remove_env(
        &self,
        reporter: &dyn ProgressReporter,
        spec: &EnvironmentSpec,
        infra: &mut InfraRecord,
    ) -> Result<()> {
        info!(
            cluster = %spec.cluster_slug,
            env = %spec.env_slug,
            "Removing environment infrastructure"
        );

        let mut queue = InfrastructureQueue::new();

        queue.push(
            StepGroup::new("Waiting for the instance to terminate")
                .step({
                    let driver = self.driver.clone();
                    move |infra: &mut InfraRecord| {
                        Box::pin(async move {
                            let Some(instance) = infra.instance.as_ref() else {
                                return Ok(());
                            };
                            driver.terminate_instance(&instance.id).await?;
                            infra.instance = None;
                            Ok(())
                        })
                    }
                })
                // The resolved type and image are lookups, not owned
                // resources; they are forgotten with the instance they were
                // resolved for.
                .step(move |infra: &mut InfraRecord| {
                    Box::pin(async move {
                        infra.instance_type = None;
                        infra.image = None;
                        Ok(())
                    })
                }),
        );

        queue.push(
            StepGroup::new("Removing the key pair and the network interface")
                .step({
                    let driver = self.driver.clone();
                    move |infra: &mut InfraRecord| {
                        Box::pin(async move {
                            let Some(key_pair) = infra.key_pair.as_ref() else {
                                return Ok(());
                            };
                            driver.remove_key_pair(&key_pair.id).await?;
                            infra.key_pair = None;
                            Ok(())
                        })
                    }
                })
                .step({
                    let driver = self.driver.clone();
                    move |infra: &mut InfraRecord| {
                        Box::pin(async move {
                            let Some(interface) = infra.network_interface.as_ref() else {
                                return Ok(());
                            };
                            driver.remove_network_interface(&interface.id).await?;
                            infra.network_interface = None;
                            Ok(())
                        })
                    }
                }),
        );

        queue.push(StepGroup::new("Removing the security group").step({
            let driver = self.driver.clone();
            move |infra: &mut InfraRecord| {
                Box::pin(async move {
                    let Some(group) = infra.security_group.as_ref() else {
                        return Ok(());
                    };
                    driver.remove_security_group(&group.id).await?;
                    infra.security_group = None;
                    Ok(())
                })
            }
        }));

        queue.run(infra, reporter).await
    }

    /// Start a stopped environment and wait until its agent is reachable.
    ///
    /// Stopped instances lose their public addressing, so the record's
    /// endpoint is refreshed from the freshly running instance.
    pub async fn start_env(
        &self,
        reporter: &dyn ProgressReporter,
        spec: &EnvironmentSpec,
        infra: &mut InfraRecord,
    ) -> Result<()> {
        let instance = infra
            .instance
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Environment has no instance to start"))?;

        reporter.start_step("Starting the instance");
        let endpoint = self.driver.start_instance(&instance.id).await?;
        instance.public_ip_address = Some(endpoint.public_ip_address.clone());
        instance.public_hostname = Some(endpoint.public_hostname);

        reporter.start_step("Waiting for the environment agent to accept connections");
        self.driver
            .wait_until_reachable(&endpoint.public_ip_address, spec.agent_port)
            .await
    }

    /// Stop a running environment and wait until it is stopped. The public
    /// addressing is dropped from the record since it dies with the stop.
    pub async fn stop_env(
        &self,
        reporter: &dyn ProgressReporter,
        _spec: &EnvironmentSpec,
        infra: &mut InfraRecord,
    ) -> Result<()> {
        let instance = infra
            .instance
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Environment has no instance to stop"))?;

        reporter.start_step("Waiting for the instance to stop");
        self.driver.stop_instance(&instance.id).await?;

        instance.public_ip_address = None;
        instance.public_hostname = None;
        Ok(())
    }

    /// Snapshot and destroy the environment's volumes, leaving the instance
    /// without volumes and the record pointing at the fresh snapshots.
    ///
    /// Returns the re-encoded record. Volumes whose workflow completed are
    /// reflected in the record even when a sibling volume failed, so a retry
    /// picks up only the remaining work.
    pub async fn save_data(
        &self,
        spec: &EnvironmentSpec,
        infra: &mut InfraRecord,
    ) -> Result<String> {
        let instance = infra
            .instance
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Environment has no instance to save data from"))?;
        let instance_id = instance.id.clone();
        let snapshot_name = spec.resource_name(ResourceKind::RootVolumeSnapshot);

        let mut updated = instance.volumes.clone();
        let result = volumes::save_volumes(
            self.driver.clone(),
            &instance_id,
            &snapshot_name,
            &mut updated,
        )
        .await;

        if let Some(instance) = infra.instance.as_mut() {
            instance.volumes = updated;
        }
        result?;

        infra.encode()
    }

    /// Recreate the environment's volumes from their snapshots and attach
    /// them. The same partial-progress rules as [`Self::save_data`] apply.
    pub async fn restore_data(
        &self,
        spec: &EnvironmentSpec,
        infra: &mut InfraRecord,
    ) -> Result<String> {
        let instance = infra
            .instance
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Environment has no instance to restore data to"))?;
        let instance_id = instance.id.clone();
        let volume_name = spec.resource_name(ResourceKind::RootVolume);

        let mut updated = instance.volumes.clone();
        let result = volumes::restore_volumes(
            self.driver.clone(),
            &instance_id,
            &volume_name,
            &spec.network.availability_zone,
            &mut updated,
        )
        .await;

        if let Some(instance) = infra.instance.as_mut() {
            instance.volumes = updated;
        }
        result?;

        infra.encode()
    }

    /// Create the provider configuration storage. Already existing storage
    /// counts as success.
    pub async fn install_config_storage(&self, reporter: &dyn ProgressReporter) -> Result<()> {
        reporter.start_step("Creating the configuration store");
        self.config.install().await
    }

    /// Remove the provider configuration storage.
    pub async fn remove_config_storage(&self, reporter: &dyn ProgressReporter) -> Result<()> {
        reporter.start_step("Removing the configuration store");
        self.config.uninstall().await
    }

    /// Fetch the single provider configuration payload. Fails with
    /// [`crate::config_store::ConfigStoreError::NotInstalled`] when nothing
    /// is stored and with
    /// [`crate::config_store::ConfigStoreError::Corrupted`] when the
    /// single-row invariant is violated.
    pub async fn lookup_config(&self) -> Result<String> {
        self.config.lookup().await
    }

    /// Upsert the provider configuration payload.
    pub async fn save_config(&self, id: &str, config_json: &str) -> Result<()> {
        self.config.save(id, config_json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullReporter;
    use crate::record::{
        BootReport, Instance, InstanceTypeInfo, InstanceVolume, KeyPair, MachineImage,
        NetworkInterface, SecurityGroup,
    };
    use crate::testing::{MockConfigStore, MockDriver, RecordingReporter, MOCK_PRIVATE_KEY_PEM};

    fn test_spec() -> EnvironmentSpec {
        EnvironmentSpec {
            cluster_slug: "default".to_string(),
            env_slug: "api".to_string(),
            instance_type: "t3.medium".to_string(),
            agent_port: 2200,
            network: ClusterNetwork {
                vpc_id: "vpc-1".to_string(),
                subnet_id: "subnet-1".to_string(),
                availability_zone: "us-east-1a".to_string(),
            },
        }
    }

    fn service(driver: Arc<MockDriver>) -> EnvironmentService {
        EnvironmentService::new(driver, Arc::new(MockConfigStore::new()))
    }

    fn populated_record() -> InfraRecord {
        InfraRecord {
            security_group: Some(SecurityGroup {
                id: "sg-mock".to_string(),
            }),
            key_pair: Some(KeyPair {
                id: "key-mock".to_string(),
                name: "devenv-api-key-pair".to_string(),
                private_key_pem: MOCK_PRIVATE_KEY_PEM.to_string(),
            }),
            network_interface: Some(NetworkInterface {
                id: "eni-mock".to_string(),
            }),
            instance_type: Some(InstanceTypeInfo {
                name: "t3.medium".to_string(),
                arch: crate::record::CpuArch::X86_64,
            }),
            image: Some(MachineImage {
                id: "ami-mock".to_string(),
                root_device_name: "/dev/sda1".to_string(),
            }),
            instance: Some(Instance {
                id: "i-mock".to_string(),
                public_ip_address: Some("203.0.113.10".to_string()),
                public_hostname: Some("ec2-203-0-113-10.compute.amazonaws.com".to_string()),
                volumes: vec![InstanceVolume {
                    device_name: "/dev/sda1".to_string(),
                    volume_id: Some("vol-root-mock".to_string()),
                    snapshot_id: None,
                }],
                boot_report: Some(BootReport {
                    host_keys: vec!["ssh-ed25519 AAAAC3mock host".to_string()],
                }),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_on_empty_record_builds_everything() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());
        let mut infra = InfraRecord::default();

        svc.create_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        assert_eq!(infra, populated_record());

        for op in [
            "create_security_group",
            "create_key_pair",
            "create_network_interface",
            "lookup_instance_type",
            "lookup_image",
            "create_instance",
            "wait_for_boot_report",
        ] {
            assert_eq!(driver.call_count(op), 1, "expected one call to {op}");
        }
    }

    #[tokio::test]
    async fn create_respects_dependency_order() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());
        let mut infra = InfraRecord::default();

        svc.create_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        let calls = driver.calls();
        let pos = |op: &str| calls.iter().position(|c| c.starts_with(op)).unwrap();
        assert!(pos("create_security_group") < pos("create_network_interface"));
        assert!(pos("create_network_interface") < pos("create_instance"));
        assert!(pos("lookup_instance_type") < pos("lookup_image"));
        assert!(pos("lookup_image") < pos("create_instance"));
        assert!(pos("create_instance") < pos("wait_for_boot_report"));
    }

    #[tokio::test]
    async fn create_narrates_each_group() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver);
        let reporter = RecordingReporter::default();
        let mut infra = InfraRecord::default();

        svc.create_env(&reporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        assert_eq!(
            reporter.steps(),
            vec![
                "Creating a security group and a key pair",
                "Creating a network interface",
                "Resolving the instance type",
                "Resolving the machine image",
                "Creating the instance",
                "Waiting for the environment to finish booting",
            ]
        );
    }

    #[tokio::test]
    async fn create_on_populated_record_skips_all_cloud_calls() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());
        let mut infra = populated_record();

        svc.create_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        assert!(driver.calls().is_empty());
        assert_eq!(infra, populated_record());
    }

    #[tokio::test]
    async fn create_resumes_from_partial_record() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());

        // Security group and key pair survived an earlier failed run.
        let mut infra = InfraRecord {
            security_group: Some(SecurityGroup {
                id: "sg-mock".to_string(),
            }),
            key_pair: Some(KeyPair {
                id: "key-mock".to_string(),
                name: "devenv-api-key-pair".to_string(),
                private_key_pem: MOCK_PRIVATE_KEY_PEM.to_string(),
            }),
            ..Default::default()
        };

        svc.create_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        assert_eq!(driver.call_count("create_security_group"), 0);
        assert_eq!(driver.call_count("create_key_pair"), 0);
        assert_eq!(driver.call_count("create_network_interface"), 1);
        assert_eq!(driver.call_count("create_instance"), 1);
        assert_eq!(infra, populated_record());
    }

    #[tokio::test]
    async fn create_failure_keeps_partial_record_and_stops() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_when("create_network_interface");
        let svc = service(driver.clone());
        let mut infra = InfraRecord::default();

        let err = svc
            .create_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("create_network_interface"));

        // Earlier groups left their resources in the record, later groups
        // never ran.
        assert!(infra.security_group.is_some());
        assert!(infra.key_pair.is_some());
        assert!(infra.network_interface.is_none());
        assert!(infra.instance.is_none());
        assert_eq!(driver.call_count("lookup_instance_type"), 0);
        assert_eq!(driver.call_count("create_instance"), 0);

        // Re-running over the persisted partial record finishes the suffix
        // without re-creating what already exists.
        let driver2 = Arc::new(MockDriver::new());
        let svc2 = service(driver2.clone());
        svc2.create_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();
        assert_eq!(driver2.call_count("create_security_group"), 0);
        assert_eq!(driver2.call_count("create_key_pair"), 0);
        assert_eq!(driver2.call_count("create_network_interface"), 1);
        assert_eq!(infra, populated_record());
    }

    #[tokio::test]
    async fn remove_tears_down_in_reverse_order() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());
        let mut infra = populated_record();

        svc.remove_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        assert!(infra.is_empty());

        let calls = driver.calls();
        let pos = |op: &str| calls.iter().position(|c| c.starts_with(op)).unwrap();
        assert!(pos("terminate_instance") < pos("remove_key_pair"));
        assert!(pos("remove_key_pair") < pos("remove_network_interface"));
        assert!(pos("remove_network_interface") < pos("remove_security_group"));
    }

    #[tokio::test]
    async fn remove_on_empty_record_is_a_no_op() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());
        let mut infra = InfraRecord::default();

        svc.remove_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn remove_mid_failure_keeps_unremoved_resources() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_when("remove_network_interface");
        let svc = service(driver.clone());
        let mut infra = populated_record();

        let err = svc
            .remove_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("remove_network_interface"));

        // Removed resources are nulled, the rest stay intact.
        assert!(infra.instance.is_none());
        assert!(infra.key_pair.is_none());
        assert!(infra.network_interface.is_some());
        assert!(infra.security_group.is_some());
        assert_eq!(driver.call_count("remove_security_group"), 0);

        // A second run only touches what is left.
        let driver2 = Arc::new(MockDriver::new());
        let svc2 = service(driver2.clone());
        svc2.remove_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();
        assert!(infra.is_empty());
        assert_eq!(driver2.call_count("terminate_instance"), 0);
        assert_eq!(driver2.call_count("remove_key_pair"), 0);
        assert_eq!(driver2.call_count("remove_network_interface"), 1);
        assert_eq!(driver2.call_count("remove_security_group"), 1);
    }

    #[tokio::test]
    async fn start_refreshes_endpoint_and_probes_agent() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());
        let mut infra = populated_record();
        // Stale addressing from before the last stop.
        if let Some(instance) = infra.instance.as_mut() {
            instance.public_ip_address = None;
            instance.public_hostname = None;
        }

        svc.start_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        let instance = infra.instance.unwrap();
        assert_eq!(instance.public_ip_address.as_deref(), Some("203.0.113.20"));
        assert_eq!(
            instance.public_hostname.as_deref(),
            Some("ec2-203-0-113-20.compute.amazonaws.com")
        );
        assert_eq!(
            driver.calls(),
            vec![
                "start_instance i-mock".to_string(),
                "wait_until_reachable 203.0.113.20 2200".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn start_without_instance_fails() {
        let svc = service(Arc::new(MockDriver::new()));
        let mut infra = InfraRecord::default();

        let err = svc
            .start_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no instance"));
    }

    #[tokio::test]
    async fn stop_clears_public_addressing() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());
        let mut infra = populated_record();

        svc.stop_env(&NullReporter, &test_spec(), &mut infra)
            .await
            .unwrap();

        let instance = infra.instance.unwrap();
        assert!(instance.public_ip_address.is_none());
        assert!(instance.public_hostname.is_none());
        assert_eq!(driver.calls(), vec!["stop_instance i-mock".to_string()]);
    }

    #[tokio::test]
    async fn save_data_replaces_volumes_and_returns_record_json() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());
        let mut infra = populated_record();

        let json = svc.save_data(&test_spec(), &mut infra).await.unwrap();

        let volumes = &infra.instance.as_ref().unwrap().volumes;
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].snapshot_id.as_deref(), Some("snap-of-vol-root-mock"));
        assert!(volumes[0].volume_id.is_none());

        let decoded = InfraRecord::decode(&json).unwrap();
        assert_eq!(decoded, infra);
        assert_eq!(
            driver.call_count("create_snapshot"),
            1,
        );
    }

    #[tokio::test]
    async fn save_data_partial_failure_keeps_completed_volume_mutations() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_when("detach_volume i-mock vol-b");
        let svc = service(driver.clone());

        let mut infra = populated_record();
        if let Some(instance) = infra.instance.as_mut() {
            instance.volumes = vec![
                InstanceVolume {
                    device_name: "/dev/sda1".to_string(),
                    volume_id: Some("vol-a".to_string()),
                    snapshot_id: None,
                },
                InstanceVolume {
                    device_name: "/dev/sdf".to_string(),
                    volume_id: Some("vol-b".to_string()),
                    snapshot_id: None,
                },
            ];
        }

        let err = svc.save_data(&test_spec(), &mut infra).await.unwrap_err();
        assert!(err.to_string().contains("detach_volume i-mock vol-b"));

        // The record reflects the volume that completed; the failed one is
        // unchanged so a retry resumes there.
        let volumes = &infra.instance.as_ref().unwrap().volumes;
        assert_eq!(volumes[0].snapshot_id.as_deref(), Some("snap-of-vol-a"));
        assert!(volumes[0].volume_id.is_none());
        assert_eq!(volumes[1].volume_id.as_deref(), Some("vol-b"));
        assert!(volumes[1].snapshot_id.is_none());
    }

    #[tokio::test]
    async fn restore_data_recreates_and_attaches_volumes() {
        let driver = Arc::new(MockDriver::new());
        let svc = service(driver.clone());

        let mut infra = populated_record();
        if let Some(instance) = infra.instance.as_mut() {
            instance.volumes = vec![InstanceVolume {
                device_name: "/dev/sda1".to_string(),
                volume_id: None,
                snapshot_id: Some("snap-1".to_string()),
            }];
        }

        let json = svc.restore_data(&test_spec(), &mut infra).await.unwrap();

        let volumes = &infra.instance.as_ref().unwrap().volumes;
        assert_eq!(volumes[0].volume_id.as_deref(), Some("vol-from-snap-1"));
        assert_eq!(volumes[0].snapshot_id.as_deref(), Some("snap-1"));
        assert!(driver
            .calls()
            .contains(&"attach_volume i-mock vol-from-snap-1 /dev/sda1".to_string()));
        assert!(driver
            .calls()
            .iter()
            .any(|c| c.starts_with("create_volume_from_snapshot devenv-api-root-volume us-east-1a")));

        let decoded = InfraRecord::decode(&json).unwrap();
        assert_eq!(decoded, infra);
    }

    #[tokio::test]
    async fn save_data_without_instance_fails() {
        let svc = service(Arc::new(MockDriver::new()));
        let mut infra = InfraRecord::default();

        assert!(svc.save_data(&test_spec(), &mut infra).await.is_err());
        assert!(svc.restore_data(&test_spec(), &mut infra).await.is_err());
    }

    #[tokio::test]
    async fn config_operations_route_through_the_guard() {
        let store = Arc::new(MockConfigStore::new());
        let svc = EnvironmentService::new(Arc::new(MockDriver::new()), store.clone());

        svc.install_config_storage(&NullReporter).await.unwrap();
        svc.save_config("config", r#"{"region":"eu-west-3"}"#)
            .await
            .unwrap();
        assert_eq!(
            svc.lookup_config().await.unwrap(),
            r#"{"region":"eu-west-3"}"#
        );

        svc.remove_config_storage(&NullReporter).await.unwrap();
        assert!(!store.table_exists());
    }
}
