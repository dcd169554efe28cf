//! IAM roles and inline role policies.
use anyhow::Context;

use crate::{self as formant, remote::Remote, HasDependencies, Resource};

/// An IAM policy document.
///
/// Serializes to the wire shape IAM expects, so it can be embedded directly
/// in a `put_role_policy` call.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    /// A document with the current policy language version.
    pub fn new(statement: Vec<Statement>) -> Self {
        PolicyDocument {
            version: "2012-10-17".to_owned(),
            statement,
        }
    }
}

impl HasDependencies for PolicyDocument {}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Statement {
    #[serde(rename = "Sid", default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Action")]
    pub action: Vec<String>,
    #[serde(rename = "Resource")]
    pub resource: Vec<String>,
}

impl HasDependencies for Statement {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// An IAM role.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Role {
    pub name: String,
    /// The trust policy stating who may assume this role.
    pub assume_role_policy: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoleOutput {
    pub name: String,
    pub arn: String,
}

impl Resource for Role {
    type Provider = aws_config::SdkConfig;
    type Error = anyhow::Error;
    type Output = RoleOutput;

    async fn create(&self, cfg: &Self::Provider) -> anyhow::Result<Self::Output> {
        let client = aws_sdk_iam::Client::new(cfg);
        log::info!("  creating role '{}'", self.name);
        let resp = client
            .create_role()
            .role_name(&self.name)
            .assume_role_policy_document(serde_json::to_string(&self.assume_role_policy)?)
            .send()
            .await?;
        let role = resp.role().context("create_role response has no role")?;
        Ok(RoleOutput {
            name: self.name.clone(),
            arn: role.arn().to_owned(),
        })
    }

    async fn delete(&self, cfg: &Self::Provider, previous: &Self::Output) -> anyhow::Result<()> {
        let client = aws_sdk_iam::Client::new(cfg);
        log::info!("  deleting role '{}'", previous.name);
        client
            .delete_role()
            .role_name(&previous.name)
            .send()
            .await?;
        Ok(())
    }
}

/// An inline policy embedded in a role.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct RolePolicy {
    pub role: Remote<String>,
    pub policy_name: String,
    pub document: PolicyDocument,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RolePolicyOutput {
    pub role: String,
    pub policy_name: String,
}

impl Resource for RolePolicy {
    type Provider = aws_config::SdkConfig;
    type Error = anyhow::Error;
    type Output = RolePolicyOutput;

    async fn create(&self, cfg: &Self::Provider) -> anyhow::Result<Self::Output> {
        let client = aws_sdk_iam::Client::new(cfg);
        let role = self.role.get()?;
        log::info!("  putting policy '{}' on role '{role}'", self.policy_name);
        client
            .put_role_policy()
            .role_name(&role)
            .policy_name(&self.policy_name)
            .policy_document(serde_json::to_string(&self.document)?)
            .send()
            .await?;
        Ok(RolePolicyOutput {
            role,
            policy_name: self.policy_name.clone(),
        })
    }

    async fn delete(&self, cfg: &Self::Provider, previous: &Self::Output) -> anyhow::Result<()> {
        let client = aws_sdk_iam::Client::new(cfg);
        log::info!(
            "  deleting policy '{}' from role '{}'",
            previous.policy_name,
            previous.role
        );
        client
            .delete_role_policy()
            .role_name(&previous.role)
            .policy_name(&previous.policy_name)
            .send()
            .await?;
        Ok(())
    }
}
