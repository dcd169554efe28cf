//! DynamoDB tables.
use std::collections::HashSet;

use anyhow::Context;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, GlobalSecondaryIndex, ProjectionType, ProvisionedThroughput,
    ScalarAttributeType,
};

use crate::{HasDependencies, Resource};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AttributeType {
    String,
    Number,
    Binary,
}

impl From<AttributeType> for ScalarAttributeType {
    fn from(value: AttributeType) -> Self {
        match value {
            AttributeType::String => ScalarAttributeType::S,
            AttributeType::Number => ScalarAttributeType::N,
            AttributeType::Binary => ScalarAttributeType::B,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KeyType {
    Hash,
    Range,
}

/// One attribute participating in a key schema.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    pub attribute_type: AttributeType,
    pub key_type: KeyType,
}

impl KeyAttribute {
    pub fn partition(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        KeyAttribute {
            name: name.into(),
            attribute_type,
            key_type: KeyType::Hash,
        }
    }

    pub fn sort(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        KeyAttribute {
            name: name.into(),
            attribute_type,
            key_type: KeyType::Range,
        }
    }

    fn to_key_schema(
        &self,
    ) -> Result<aws_sdk_dynamodb::types::KeySchemaElement, aws_sdk_dynamodb::error::BuildError>
    {
        aws_sdk_dynamodb::types::KeySchemaElement::builder()
            .attribute_name(&self.name)
            .key_type(match self.key_type {
                KeyType::Hash => aws_sdk_dynamodb::types::KeyType::Hash,
                KeyType::Range => aws_sdk_dynamodb::types::KeyType::Range,
            })
            .build()
    }
}

/// What an index copies from the base table.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Projection {
    All,
    KeysOnly,
    Include { non_key_attributes: Vec<String> },
}

impl Projection {
    fn to_sdk(&self) -> aws_sdk_dynamodb::types::Projection {
        let builder = aws_sdk_dynamodb::types::Projection::builder();
        match self {
            Projection::All => builder.projection_type(ProjectionType::All).build(),
            Projection::KeysOnly => builder.projection_type(ProjectionType::KeysOnly).build(),
            Projection::Include { non_key_attributes } => builder
                .projection_type(ProjectionType::Include)
                .set_non_key_attributes(Some(non_key_attributes.clone()))
                .build(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GlobalIndex {
    pub name: String,
    pub key_schema: Vec<KeyAttribute>,
    pub projection: Projection,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BillingMode {
    PayPerRequest,
    Provisioned {
        read_capacity_units: i64,
        write_capacity_units: i64,
    },
}

/// A DynamoDB table.
///
/// Attribute definitions are derived from the table and index key schemas,
/// deduplicated by name.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Table {
    pub name: String,
    pub key_schema: Vec<KeyAttribute>,
    pub global_secondary_indexes: Vec<GlobalIndex>,
    pub billing_mode: BillingMode,
}

impl HasDependencies for Table {}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TableOutput {
    pub name: String,
    pub arn: String,
}

impl Resource for Table {
    type Provider = aws_config::SdkConfig;
    type Error = anyhow::Error;
    type Output = TableOutput;

    async fn create(&self, cfg: &Self::Provider) -> anyhow::Result<Self::Output> {
        let client = aws_sdk_dynamodb::Client::new(cfg);
        log::info!("  creating table '{}'", self.name);

        let mut seen = HashSet::new();
        let mut definitions = vec![];
        let all_keys = self.key_schema.iter().chain(
            self.global_secondary_indexes
                .iter()
                .flat_map(|index| index.key_schema.iter()),
        );
        for key in all_keys {
            if seen.insert(key.name.clone()) {
                definitions.push(
                    AttributeDefinition::builder()
                        .attribute_name(&key.name)
                        .attribute_type(key.attribute_type.into())
                        .build()?,
                );
            }
        }

        let mut request = client
            .create_table()
            .table_name(&self.name)
            .set_attribute_definitions(Some(definitions));
        for key in self.key_schema.iter() {
            request = request.key_schema(key.to_key_schema()?);
        }
        for index in self.global_secondary_indexes.iter() {
            let mut builder = GlobalSecondaryIndex::builder()
                .index_name(&index.name)
                .projection(index.projection.to_sdk());
            for key in index.key_schema.iter() {
                builder = builder.key_schema(key.to_key_schema()?);
            }
            if let BillingMode::Provisioned {
                read_capacity_units,
                write_capacity_units,
            } = self.billing_mode
            {
                builder = builder.provisioned_throughput(
                    ProvisionedThroughput::builder()
                        .read_capacity_units(read_capacity_units)
                        .write_capacity_units(write_capacity_units)
                        .build()?,
                );
            }
            request = request.global_secondary_indexes(builder.build()?);
        }
        request = match self.billing_mode {
            BillingMode::PayPerRequest => {
                request.billing_mode(aws_sdk_dynamodb::types::BillingMode::PayPerRequest)
            }
            BillingMode::Provisioned {
                read_capacity_units,
                write_capacity_units,
            } => request
                .billing_mode(aws_sdk_dynamodb::types::BillingMode::Provisioned)
                .provisioned_throughput(
                    ProvisionedThroughput::builder()
                        .read_capacity_units(read_capacity_units)
                        .write_capacity_units(write_capacity_units)
                        .build()?,
                ),
        };

        let resp = request.send().await?;
        let arn = resp
            .table_description()
            .and_then(|description| description.table_arn())
            .context("create_table response has no arn")?
            .to_owned();
        Ok(TableOutput {
            name: self.name.clone(),
            arn,
        })
    }

    async fn delete(&self, cfg: &Self::Provider, previous: &Self::Output) -> anyhow::Result<()> {
        let client = aws_sdk_dynamodb::Client::new(cfg);
        log::info!("  deleting table '{}'", previous.name);
        client
            .delete_table()
            .table_name(&previous.name)
            .send()
            .await?;
        Ok(())
    }
}
