//! Shared AWS configuration context.
//!
//! Provides [`AwsContext`] for loading AWS SDK configuration once and
//! creating multiple service clients from the same config, instead of every
//! call site loading its own.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use std::sync::Arc;

/// Shared AWS configuration context for creating service clients.
#[derive(Clone)]
pub struct AwsContext {
    config: Arc<SdkConfig>,
    region: String,
}

impl AwsContext {
    /// Load AWS configuration for the specified region.
    ///
    /// This loads credentials, region configuration, and other AWS SDK
    /// settings from the environment, config files, and IAM roles.
    pub async fn new(region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self {
            config: Arc::new(config),
            region: region.to_string(),
        }
    }

    /// Get the underlying SDK config for direct client construction.
    pub fn sdk_config(&self) -> &SdkConfig {
        &self.config
    }

    /// Get the region string.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Create an EC2 client from this context.
    pub fn ec2_client(&self) -> aws_sdk_ec2::Client {
        aws_sdk_ec2::Client::new(self.sdk_config())
    }

    /// Create a DynamoDB client from this context.
    pub fn dynamodb_client(&self) -> aws_sdk_dynamodb::Client {
        aws_sdk_dynamodb::Client::new(self.sdk_config())
    }
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}
