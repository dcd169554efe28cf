//! S3 buckets, bucket notifications and objects.
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{Event, LambdaFunctionConfiguration, NotificationConfiguration},
};

use crate::{self as formant, remote::Remote, HasDependencies, Resource};

/// An S3 bucket.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Bucket {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BucketOutput {
    pub name: String,
    pub arn: String,
}

impl Resource for Bucket {
    type Provider = aws_config::SdkConfig;
    type Error = anyhow::Error;
    type Output = BucketOutput;

    async fn create(&self, cfg: &Self::Provider) -> anyhow::Result<Self::Output> {
        let client = aws_sdk_s3::Client::new(cfg);
        log::info!("  creating bucket '{}'", self.name);
        client.create_bucket().bucket(&self.name).send().await?;
        Ok(BucketOutput {
            name: self.name.clone(),
            arn: format!("arn:aws:s3:::{}", self.name),
        })
    }

    async fn delete(&self, cfg: &Self::Provider, previous: &Self::Output) -> anyhow::Result<()> {
        let client = aws_sdk_s3::Client::new(cfg);
        log::info!("  deleting bucket '{}'", previous.name);
        client.delete_bucket().bucket(&previous.name).send().await?;
        Ok(())
    }
}

/// A notification configuration that invokes a Lambda function when events
/// occur in a bucket.
///
/// S3 validates the target permission when the configuration is put, so this
/// resource should carry an explicit dependency on the invoke permission.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct BucketNotification {
    pub bucket: Remote<String>,
    pub configuration_id: String,
    pub function_arn: Remote<String>,
    /// S3 event names, eg "s3:ObjectCreated:*".
    pub events: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BucketNotificationOutput {
    pub bucket: String,
    pub configuration_id: String,
}

impl Resource for BucketNotification {
    type Provider = aws_config::SdkConfig;
    type Error = anyhow::Error;
    type Output = BucketNotificationOutput;

    async fn create(&self, cfg: &Self::Provider) -> anyhow::Result<Self::Output> {
        let client = aws_sdk_s3::Client::new(cfg);
        let bucket = self.bucket.get()?;
        log::info!("  configuring notifications on bucket '{bucket}'");
        let configuration = NotificationConfiguration::builder()
            .lambda_function_configurations(
                LambdaFunctionConfiguration::builder()
                    .id(&self.configuration_id)
                    .lambda_function_arn(self.function_arn.get()?)
                    .set_events(Some(
                        self.events.iter().map(|e| Event::from(e.as_str())).collect(),
                    ))
                    .build()?,
            )
            .build();
        client
            .put_bucket_notification_configuration()
            .bucket(&bucket)
            .notification_configuration(configuration)
            .send()
            .await?;
        Ok(BucketNotificationOutput {
            bucket,
            configuration_id: self.configuration_id.clone(),
        })
    }

    async fn delete(&self, cfg: &Self::Provider, previous: &Self::Output) -> anyhow::Result<()> {
        let client = aws_sdk_s3::Client::new(cfg);
        log::info!("  clearing notifications on bucket '{}'", previous.bucket);
        client
            .put_bucket_notification_configuration()
            .bucket(&previous.bucket)
            .notification_configuration(NotificationConfiguration::builder().build())
            .send()
            .await?;
        Ok(())
    }
}

/// An object uploaded into a bucket.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Object {
    pub bucket: Remote<String>,
    pub key: String,
    pub contents: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ObjectOutput {
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
}

impl Resource for Object {
    type Provider = aws_config::SdkConfig;
    type Error = anyhow::Error;
    type Output = ObjectOutput;

    async fn create(&self, cfg: &Self::Provider) -> anyhow::Result<Self::Output> {
        let client = aws_sdk_s3::Client::new(cfg);
        let bucket = self.bucket.get()?;
        log::info!("  putting object '{}' into bucket '{bucket}'", self.key);
        let resp = client
            .put_object()
            .bucket(&bucket)
            .key(&self.key)
            .body(ByteStream::from(self.contents.clone().into_bytes()))
            .send()
            .await?;
        Ok(ObjectOutput {
            bucket,
            key: self.key.clone(),
            etag: resp.e_tag().map(|t| t.to_owned()),
        })
    }

    async fn delete(&self, cfg: &Self::Provider, previous: &Self::Output) -> anyhow::Result<()> {
        let client = aws_sdk_s3::Client::new(cfg);
        log::info!(
            "  deleting object '{}' from bucket '{}'",
            previous.key,
            previous.bucket
        );
        client
            .delete_object()
            .bucket(&previous.bucket)
            .key(&previous.key)
            .send()
            .await?;
        Ok(())
    }
}
