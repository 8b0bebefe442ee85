//! AWS realizations of the cloud driver and config store seams.

pub mod context;
pub mod dynamodb;
pub mod ec2;
pub mod error;

pub use context::AwsContext;
pub use dynamodb::DynamoDbConfigStore;
pub use ec2::Ec2Driver;
pub use error::{classify_anyhow_error, classify_aws_error, classify_sdk_error, AwsError};
