//! Deterministic resource naming.
//!
//! Every cloud resource created for an environment carries a name derived
//! from the cluster and environment slugs, so re-runs of a partially failed
//! operation reference the same names and operators can attribute resources
//! in the console at a glance.

/// Name of the implicit cluster that environments belong to unless the host
/// tool says otherwise. Elided from resource names to keep them short.
pub const DEFAULT_CLUSTER_NAME: &str = "default";

const RESOURCE_PREFIX: &str = "devenv";

/// Logical resource kinds that get named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    SecurityGroup,
    KeyPair,
    NetworkInterface,
    Instance,
    RootVolume,
    RootVolumeSnapshot,
}

impl ResourceKind {
    fn slug(self) -> &'static str {
        match self {
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::KeyPair => "key-pair",
            ResourceKind::NetworkInterface => "network-interface",
            ResourceKind::Instance => "instance",
            ResourceKind::RootVolume => "root-volume",
            ResourceKind::RootVolumeSnapshot => "root-volume-snapshot",
        }
    }
}

/// Build the name for an environment-scoped resource.
///
/// The default cluster is elided: `devenv-<env>-<kind>` rather than
/// `devenv-default-<env>-<kind>`.
pub fn env_resource_name(cluster_slug: &str, env_slug: &str, kind: ResourceKind) -> String {
    if cluster_slug == DEFAULT_CLUSTER_NAME {
        format!("{}-{}-{}", RESOURCE_PREFIX, env_slug, kind.slug())
    } else {
        format!(
            "{}-{}-{}-{}",
            RESOURCE_PREFIX,
            cluster_slug,
            env_slug,
            kind.slug()
        )
    }
}

/// Build the name for a cluster-scoped resource.
pub fn cluster_resource_name(cluster_slug: &str, kind: ResourceKind) -> String {
    if cluster_slug == DEFAULT_CLUSTER_NAME {
        format!("{}-{}", RESOURCE_PREFIX, kind.slug())
    } else {
        format!("{}-{}-{}", RESOURCE_PREFIX, cluster_slug, kind.slug())
    }
}
