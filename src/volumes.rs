//! The concurrent volume lifecycle coordinator.
//!
//! Applies a per-volume workflow (snapshot-and-detach for save, or
//! restore-and-attach for restore) to every volume of one instance
//! concurrently, then joins. One task is spawned per volume index; each task
//! works on a private clone of its volume and owns exactly one slot of the
//! result array, so no synchronization beyond task completion is needed.
//!
//! A failure in one task never interrupts its siblings: all tasks run to
//! their own completion or failure, the successful slots are written back
//! into the caller's volume list, and only then is the first error (in index
//! order) returned. That keeps the overall call fail-fast for the caller
//! while preserving resumability at volume granularity.

use crate::driver::CloudDriver;
use crate::record::InstanceVolume;
use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Snapshot, detach, and destroy every volume of the instance concurrently.
///
/// Per volume: create a new snapshot, remove the previous snapshot only once
/// the new one exists (there is never a moment with zero valid snapshots),
/// record the new snapshot id, detach the volume, and destroy it. On success
/// the volume entry keeps only its device name and the fresh snapshot id.
pub async fn save_volumes(
    driver: Arc<dyn CloudDriver>,
    instance_id: &str,
    snapshot_name: &str,
    volumes: &mut [InstanceVolume],
) -> Result<()> {
    info!(
        instance_id = %instance_id,
        count = volumes.len(),
        "Saving instance volumes"
    );

    let handles: Vec<_> = volumes
        .iter()
        .map(|volume| {
            let driver = driver.clone();
            let instance_id = instance_id.to_string();
            let snapshot_name = snapshot_name.to_string();
            let volume = volume.clone();

            tokio::spawn(
                async move { save_one_volume(driver, &instance_id, &snapshot_name, volume).await },
            )
        })
        .collect();

    join_volume_tasks(handles, volumes).await
}

/// Recreate and attach every volume of the instance from its recorded
/// snapshot concurrently.
///
/// Per volume: create a fresh volume from the snapshot in the target
/// availability zone, record the new volume id, and attach it at the
/// volume's original device name.
pub async fn restore_volumes(
    driver: Arc<dyn CloudDriver>,
    instance_id: &str,
    volume_name: &str,
    availability_zone: &str,
    volumes: &mut [InstanceVolume],
) -> Result<()> {
    info!(
        instance_id = %instance_id,
        count = volumes.len(),
        availability_zone = %availability_zone,
        "Restoring instance volumes"
    );

    let handles: Vec<_> = volumes
        .iter()
        .map(|volume| {
            let driver = driver.clone();
            let instance_id = instance_id.to_string();
            let volume_name = volume_name.to_string();
            let availability_zone = availability_zone.to_string();
            let volume = volume.clone();

            tokio::spawn(async move {
                restore_one_volume(driver, &instance_id, &volume_name, &availability_zone, volume)
                    .await
            })
        })
        .collect();

    join_volume_tasks(handles, volumes).await
}

/// Wait for every per-volume task, write successful results back into their
/// slots, and return the first error in index order.
async fn join_volume_tasks(
    handles: Vec<JoinHandle<Result<InstanceVolume>>>,
    volumes: &mut [InstanceVolume],
) -> Result<()> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("Volume task panicked: {e}")),
        };
        results.push(result);
    }

    let mut first_error = None;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(updated) => volumes[index] = updated,
            Err(e) => {
                warn!(
                    volume_index = index,
                    device = %volumes[index].device_name,
                    error = ?e,
                    "Volume workflow failed"
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn save_one_volume(
    driver: Arc<dyn CloudDriver>,
    instance_id: &str,
    snapshot_name: &str,
    mut volume: InstanceVolume,
) -> Result<InstanceVolume> {
    let volume_id = volume.volume_id.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "Volume at device {} has no volume id to snapshot",
            volume.device_name
        )
    })?;

    let new_snapshot_id = driver.create_snapshot(snapshot_name, &volume_id).await?;

    // Remove the superseded snapshot only now that the new one exists.
    if let Some(old_snapshot_id) = volume.snapshot_id.take() {
        driver.remove_snapshot(&old_snapshot_id).await?;
    }
    volume.snapshot_id = Some(new_snapshot_id);

    driver
        .detach_volume(instance_id, &volume_id, &volume.device_name)
        .await?;

    driver.remove_volume(&volume_id).await?;
    volume.volume_id = None;

    Ok(volume)
}

async fn restore_one_volume(
    driver: Arc<dyn CloudDriver>,
    instance_id: &str,
    volume_name: &str,
    availability_zone: &str,
    mut volume: InstanceVolume,
) -> Result<InstanceVolume> {
    let snapshot_id = volume.snapshot_id.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "Volume at device {} has no snapshot to restore from",
            volume.device_name
        )
    })?;

    let volume_id = driver
        .create_volume_from_snapshot(volume_name, availability_zone, &snapshot_id)
        .await?;
    volume.volume_id = Some(volume_id.clone());

    driver
        .attach_volume(instance_id, &volume_id, &volume.device_name)
        .await?;

    Ok(volume)
}
