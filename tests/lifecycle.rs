//! Full environment lifecycle over the mock driver, persisting the record
//! between operations the way the host tool does: every operation's record
//! is encoded, stored, and decoded again before the next operation runs.

use devenv_ec2::progress::NullReporter;
use devenv_ec2::testing::{MockConfigStore, MockDriver};
use devenv_ec2::{ClusterNetwork, EnvironmentService, EnvironmentSpec, InfraRecord};
use std::sync::Arc;

fn spec() -> EnvironmentSpec {
    EnvironmentSpec {
        cluster_slug: "staging".to_string(),
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

/// Re-persist and reload the record, as the host tool does between calls.
fn persist_roundtrip(infra: &InfraRecord) -> InfraRecord {
    let json = infra.encode().unwrap();
    InfraRecord::decode(&json).unwrap()
}

#[tokio::test]
async fn full_lifecycle_roundtrip() {
    let driver = Arc::new(MockDriver::new());
    let svc = EnvironmentService::new(driver.clone(), Arc::new(MockConfigStore::new()));

    // Create from a blank persisted blob.
    let mut infra = InfraRecord::decode("").unwrap();
    svc.create_env(&NullReporter, &spec(), &mut infra)
        .await
        .unwrap();

    let instance = infra.instance.as_ref().unwrap();
    assert!(instance.boot_report.is_some());
    assert_eq!(instance.volumes.len(), 1);
    assert_eq!(
        instance.volumes[0].volume_id.as_deref(),
        Some("vol-root-mock")
    );

    // Stop, then start again: the endpoint is refreshed.
    let mut infra = persist_roundtrip(&infra);
    svc.stop_env(&NullReporter, &spec(), &mut infra)
        .await
        .unwrap();
    assert!(infra
        .instance
        .as_ref()
        .unwrap()
        .public_ip_address
        .is_none());

    let mut infra = persist_roundtrip(&infra);
    svc.start_env(&NullReporter, &spec(), &mut infra)
        .await
        .unwrap();
    assert_eq!(
        infra
            .instance
            .as_ref()
            .unwrap()
            .public_ip_address
            .as_deref(),
        Some("203.0.113.20")
    );

    // Save the data away: the volume becomes a snapshot.
    let mut infra = persist_roundtrip(&infra);
    let saved_json = svc.save_data(&spec(), &mut infra).await.unwrap();

    let mut infra = InfraRecord::decode(&saved_json).unwrap();
    {
        let volumes = &infra.instance.as_ref().unwrap().volumes;
        assert!(volumes[0].volume_id.is_none());
        assert_eq!(
            volumes[0].snapshot_id.as_deref(),
            Some("snap-of-vol-root-mock")
        );
    }

    // Restore it: a fresh volume is created from the snapshot and attached.
    let restored_json = svc.restore_data(&spec(), &mut infra).await.unwrap();
    let mut infra = InfraRecord::decode(&restored_json).unwrap();
    {
        let volumes = &infra.instance.as_ref().unwrap().volumes;
        assert_eq!(
            volumes[0].volume_id.as_deref(),
            Some("vol-from-snap-of-vol-root-mock")
        );
    }

    // Tear everything down.
    let mut infra = persist_roundtrip(&infra);
    svc.remove_env(&NullReporter, &spec(), &mut infra)
        .await
        .unwrap();
    assert!(infra.is_empty());
    assert_eq!(infra.encode().unwrap(), r#"{"version":1}"#);
}

#[tokio::test]
async fn create_failure_resumes_across_persistence() {
    // First attempt dies creating the instance.
    let driver = Arc::new(MockDriver::new());
    driver.fail_when("create_instance");
    let svc = EnvironmentService::new(driver.clone(), Arc::new(MockConfigStore::new()));

    let mut infra = InfraRecord::decode("").unwrap();
    let err = svc
        .create_env(&NullReporter, &spec(), &mut infra)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("create_instance"));

    // The partial record still encodes; the host tool persists it.
    let persisted = infra.encode().unwrap();

    // A later invocation picks up where the first left off.
    let driver = Arc::new(MockDriver::new());
    let svc = EnvironmentService::new(driver.clone(), Arc::new(MockConfigStore::new()));

    let mut infra = InfraRecord::decode(&persisted).unwrap();
    svc.create_env(&NullReporter, &spec(), &mut infra)
        .await
        .unwrap();

    assert_eq!(driver.call_count("create_security_group"), 0);
    assert_eq!(driver.call_count("create_key_pair"), 0);
    assert_eq!(driver.call_count("create_network_interface"), 0);
    assert_eq!(driver.call_count("lookup_instance_type"), 0);
    assert_eq!(driver.call_count("lookup_image"), 0);
    assert_eq!(driver.call_count("create_instance"), 1);
    assert_eq!(driver.call_count("wait_for_boot_report"), 1);
    assert!(infra.instance.is_some());
}

#[tokio::test]
async fn config_storage_roundtrip() {
    let store = Arc::new(MockConfigStore::new());
    let svc = EnvironmentService::new(Arc::new(MockDriver::new()), store);

    // Nothing installed yet.
    let err = svc.lookup_config().await.unwrap_err();
    assert!(err.to_string().contains("not installed"));

    svc.install_config_storage(&NullReporter).await.unwrap();
    svc.save_config("config", r#"{"cluster":"staging"}"#)
        .await
        .unwrap();
    assert_eq!(
        svc.lookup_config().await.unwrap(),
        r#"{"cluster":"staging"}"#
    );

    svc.remove_config_storage(&NullReporter).await.unwrap();
    let err = svc.lookup_config().await.unwrap_err();
    assert!(err.to_string().contains("not installed"));
}
