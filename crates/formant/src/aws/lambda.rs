//! Lambda functions and invoke permissions.
use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use aws_sdk_lambda::{
    error::DisplayErrorContext,
    primitives::Blob,
    types::{Environment, FunctionCode, Runtime},
};

use crate::{self as formant, remote::Remote, HasDependencies, Resource};

/// A Lambda function deployed from a local zip artifact.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Function {
    pub name: String,
    pub role_arn: Remote<String>,
    pub handler: String,
    /// Runtime identifier, eg "provided.al2023".
    pub runtime: String,
    pub code_path: std::path::PathBuf,
    pub environment: BTreeMap<String, Remote<String>>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionOutput {
    pub name: String,
    pub arn: String,
}

impl Resource for Function {
    type Provider = aws_config::SdkConfig;
    type Error = anyhow::Error;
    type Output = FunctionOutput;

    async fn create(&self, cfg: &Self::Provider) -> anyhow::Result<Self::Output> {
        let client = aws_sdk_lambda::Client::new(cfg);
        log::info!("  creating function '{}'", self.name);
        let bytes = tokio::fs::read(&self.code_path)
            .await
            .with_context(|| format!("reading code artifact {:?}", self.code_path))?;
        let mut variables = HashMap::new();
        for (key, value) in self.environment.iter() {
            variables.insert(key.clone(), value.get()?);
        }

        let mut tries = 5;
        let resp = loop {
            let result = client
                .create_function()
                .function_name(&self.name)
                .role(self.role_arn.get()?)
                .handler(&self.handler)
                .runtime(Runtime::from(self.runtime.as_str()))
                .environment(
                    Environment::builder()
                        .set_variables(Some(variables.clone()))
                        .build(),
                )
                .code(
                    FunctionCode::builder()
                        .zip_file(Blob::new(bytes.clone()))
                        .build(),
                )
                .publish(true)
                .send()
                .await;
            match result {
                Ok(resp) => break resp,
                // A freshly created role can take a few seconds to become
                // assumable by Lambda.
                Err(err) if tries > 0 => {
                    tries -= 1;
                    log::warn!(
                        "  create_function failed, retrying in 5s ({} tries left): {}",
                        tries,
                        DisplayErrorContext(&err)
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
                Err(err) => return Err(err.into()),
            }
        };
        let arn = resp
            .function_arn()
            .context("create_function response has no arn")?
            .to_owned();
        Ok(FunctionOutput {
            name: self.name.clone(),
            arn,
        })
    }

    async fn delete(&self, cfg: &Self::Provider, previous: &Self::Output) -> anyhow::Result<()> {
        let client = aws_sdk_lambda::Client::new(cfg);
        log::info!("  deleting function '{}'", previous.name);
        client
            .delete_function()
            .function_name(&previous.name)
            .send()
            .await?;
        Ok(())
    }
}

/// A resource-based permission allowing a principal to invoke a function.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Permission {
    pub function: Remote<String>,
    pub statement_id: String,
    /// The action to allow, eg "lambda:InvokeFunction".
    pub action: String,
    /// The service principal, eg "s3.amazonaws.com".
    pub principal: String,
    pub source_arn: Remote<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PermissionOutput {
    pub function: String,
    pub statement_id: String,
    pub source_arn: String,
}

impl Resource for Permission {
    type Provider = aws_config::SdkConfig;
    type Error = anyhow::Error;
    type Output = PermissionOutput;

    async fn create(&self, cfg: &Self::Provider) -> anyhow::Result<Self::Output> {
        let client = aws_sdk_lambda::Client::new(cfg);
        let function = self.function.get()?;
        let source_arn = self.source_arn.get()?;
        log::info!(
            "  granting '{}' on function '{function}' to '{}'",
            self.action,
            self.principal
        );
        client
            .add_permission()
            .function_name(&function)
            .statement_id(&self.statement_id)
            .action(&self.action)
            .principal(&self.principal)
            .source_arn(&source_arn)
            .send()
            .await?;
        Ok(PermissionOutput {
            function,
            statement_id: self.statement_id.clone(),
            source_arn,
        })
    }

    async fn delete(&self, cfg: &Self::Provider, previous: &Self::Output) -> anyhow::Result<()> {
        let client = aws_sdk_lambda::Client::new(cfg);
        log::info!(
            "  revoking statement '{}' from function '{}'",
            previous.statement_id,
            previous.function
        );
        client
            .remove_permission()
            .function_name(&previous.function)
            .statement_id(&previous.statement_id)
            .send()
            .await?;
        Ok(())
    }
}
