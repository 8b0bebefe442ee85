//! DynamoDB realization of the configuration store.
//!
//! One table, hash-keyed by record id, holding the host tool's configuration
//! blob. Table lifecycle is forgiving: creating an existing table and
//! removing a missing one are both success, and scanning a missing table
//! yields no rows so the guard can report "not installed".

use crate::aws::context::AwsContext;
use crate::aws::error::classify_sdk_error;
use crate::config_store::{ConfigRecord, ConfigStore};
use crate::wait::{wait_for_resource, WaitConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus,
};
use aws_sdk_dynamodb::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Default name of the configuration table.
pub const CONFIG_TABLE_NAME: &str = "devenv-config";

const ID_ATTRIBUTE: &str = "id";
const CONFIG_JSON_ATTRIBUTE: &str = "config_json";

/// Maximum wait for the table to become active after creation
const TABLE_WAIT: Duration = Duration::from_secs(120);

/// DynamoDB-backed configuration store.
pub struct DynamoDbConfigStore {
    client: Client,
    table_name: String,
}

impl DynamoDbConfigStore {
    /// Create a new store (loads AWS config from the environment).
    pub async fn new(region: &str) -> Self {
        let ctx = AwsContext::new(region).await;
        Self::from_context(&ctx)
    }

    /// Create a store from a pre-loaded AWS context.
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.dynamodb_client(),
            table_name: CONFIG_TABLE_NAME.to_string(),
        }
    }

    /// Use a non-default table name.
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    async fn wait_for_table_active(&self) -> Result<()> {
        wait_for_resource(
            WaitConfig::with_timeout(TABLE_WAIT),
            || async {
                let response = self
                    .client
                    .describe_table()
                    .table_name(&self.table_name)
                    .send()
                    .await
                    .context("Failed to describe config table")?;

                Ok(response
                    .table()
                    .and_then(|t| t.table_status())
                    .map(|status| *status == TableStatus::Active)
                    .unwrap_or(false))
            },
            &format!("config table {} active", self.table_name),
        )
        .await
    }
}

#[async_trait]
impl ConfigStore for DynamoDbConfigStore {
    async fn create_table(&self) -> Result<()> {
        info!(table = %self.table_name, "Creating config table");

        let result = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(ID_ATTRIBUTE)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .context("Invalid attribute definition")?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(ID_ATTRIBUTE)
                    .key_type(KeyType::Hash)
                    .build()
                    .context("Invalid key schema")?,
            )
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        match result {
            Ok(_) => {}
            Err(e) => {
                if classify_sdk_error(&e).is_already_exists() {
                    debug!(table = %self.table_name, "Config table already exists");
                } else {
                    return Err(anyhow::Error::from(e)).context("Failed to create config table");
                }
            }
        }

        self.wait_for_table_active().await
    }

    async fn remove_table(&self) -> Result<()> {
        info!(table = %self.table_name, "Removing config table");

        match self
            .client
            .delete_table()
            .table_name(&self.table_name)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if classify_sdk_error(&e).is_not_found() {
                    debug!(table = %self.table_name, "Config table already removed");
                    Ok(())
                } else {
                    Err(anyhow::Error::from(e)).context("Failed to delete config table")
                }
            }
        }
    }

    async fn scan_records(&self) -> Result<Vec<ConfigRecord>> {
        let response = match self
            .client
            .scan()
            .table_name(&self.table_name)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // A missing table is the "not installed" signal, not an error.
                if classify_sdk_error(&e).is_not_found() {
                    return Ok(Vec::new());
                }
                return Err(anyhow::Error::from(e)).context("Failed to scan config table");
            }
        };

        response
            .items()
            .iter()
            .map(|item| {
                let id = item
                    .get(ID_ATTRIBUTE)
                    .and_then(|value| value.as_s().ok())
                    .context("Config record has no id attribute")?
                    .clone();
                let config_json = item
                    .get(CONFIG_JSON_ATTRIBUTE)
                    .and_then(|value| value.as_s().ok())
                    .context("Config record has no config_json attribute")?
                    .clone();
                Ok(ConfigRecord { id, config_json })
            })
            .collect()
    }

    async fn put_record(&self, record: &ConfigRecord) -> Result<()> {
        debug!(table = %self.table_name, id = %record.id, "Upserting config record");

        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(ID_ATTRIBUTE, AttributeValue::S(record.id.clone()))
            .item(
                CONFIG_JSON_ATTRIBUTE,
                AttributeValue::S(record.config_json.clone()),
            )
            .send()
            .await
            .context("Failed to put config record")?;

        Ok(())
    }
}
