//! Resource implementations for Amazon Web Services.
//!
//! The provider for every resource here is [`aws_config::SdkConfig`], and
//! errors are surfaced through [`anyhow::Error`].

pub mod dynamodb;
pub mod iam;
pub mod lambda;
pub mod s3;
