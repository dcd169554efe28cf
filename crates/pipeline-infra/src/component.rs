//! The pipeline component: a bucket wired to a Lambda function.
use std::{collections::BTreeMap, path::PathBuf};

use aws_config::SdkConfig;
use formant::{
    aws::{iam, lambda, s3},
    remote::Remote,
    DeclaredResource, Stack,
};

use crate::policy::{lambda_trust_document, resolve_policy, PolicyKind};

/// Where a function's code comes from and how to run it.
#[derive(Clone, Debug)]
pub struct FunctionSource {
    /// Path to the zipped artifact.
    pub code_path: PathBuf,
    pub handler: String,
    /// Runtime identifier, eg "provided.al2023".
    pub runtime: String,
}

/// Parameters for one pipeline instance.
#[derive(Clone, Debug)]
pub struct PipelineParams {
    /// Instance name. Must be non-empty and unique within the stack; every
    /// owned resource is named by suffixing it.
    pub name: String,
    pub policy_kind: PolicyKind,
    pub source: FunctionSource,
    /// Environment variables handed to the function.
    pub environment: BTreeMap<String, Remote<String>>,
}

/// A bucket that invokes a Lambda function for every object created in it.
///
/// One instance owns seven resources: the bucket, the function's execution
/// role, the role's inline policy, the function itself, the invoke
/// permission, the bucket notification, and a seed object uploaded once the
/// notification is live.
pub struct EventPipeline {
    pub name: String,
    pub bucket: DeclaredResource<s3::Bucket, s3::BucketOutput>,
    pub role: DeclaredResource<iam::Role, iam::RoleOutput>,
    pub policy: DeclaredResource<iam::RolePolicy, iam::RolePolicyOutput>,
    pub function: DeclaredResource<lambda::Function, lambda::FunctionOutput>,
    pub permission: DeclaredResource<lambda::Permission, lambda::PermissionOutput>,
    pub notification: DeclaredResource<s3::BucketNotification, s3::BucketNotificationOutput>,
    pub object: DeclaredResource<s3::Object, s3::ObjectOutput>,
}

impl EventPipeline {
    /// Declare one pipeline instance as a component owning its seven
    /// resources.
    pub fn declare(
        stack: &mut Stack<SdkConfig>,
        params: PipelineParams,
    ) -> Result<Self, formant::Error> {
        let PipelineParams {
            name,
            policy_kind,
            source,
            environment,
        } = params;
        let group = stack.component(&name)?;

        let bucket = stack.resource_in(
            &group,
            format!("{name}-bucket"),
            s3::Bucket {
                name: format!("{name}-bucket"),
            },
        )?;
        let role = stack.resource_in(
            &group,
            format!("{name}-role"),
            iam::Role {
                name: format!("{name}-role"),
                assume_role_policy: lambda_trust_document(),
            },
        )?;
        let policy = stack.resource_in(
            &group,
            format!("{name}-policy"),
            iam::RolePolicy {
                role: role.output(|r| r.name.clone()),
                policy_name: format!("{name}-policy"),
                document: resolve_policy(policy_kind),
            },
        )?;
        let function = stack.resource_in(
            &group,
            format!("{name}-function"),
            lambda::Function {
                name: format!("{name}-function"),
                role_arn: role.output(|r| r.arn.clone()),
                handler: source.handler,
                runtime: source.runtime,
                code_path: source.code_path,
                environment,
            },
        )?;
        let permission = stack.resource_in(
            &group,
            format!("{name}-permission"),
            lambda::Permission {
                function: function.output(|f| f.name.clone()),
                statement_id: format!("{name}-allow-bucket"),
                action: "lambda:InvokeFunction".to_owned(),
                principal: "s3.amazonaws.com".to_owned(),
                source_arn: bucket.output(|b| b.arn.clone()),
            },
        )?;
        let notification = stack.resource_in(
            &group,
            format!("{name}-notification"),
            s3::BucketNotification {
                bucket: bucket.output(|b| b.name.clone()),
                configuration_id: format!("{name}-object-created"),
                function_arn: function.output(|f| f.arn.clone()),
                events: vec!["s3:ObjectCreated:*".to_owned()],
            },
        )?;
        // S3 validates the invoke permission when the configuration is put.
        stack.add_dependency(&notification, &permission)?;
        let object = stack.resource_in(
            &group,
            format!("{name}-object"),
            s3::Object {
                bucket: bucket.output(|b| b.name.clone()),
                key: format!("{name}-object.txt"),
                contents: format!("seed object for the '{name}' pipeline\n"),
            },
        )?;
        // Uploading before the notification is live would drop the event.
        stack.add_dependency(&object, &notification)?;

        Ok(EventPipeline {
            name,
            bucket,
            role,
            policy,
            function,
            permission,
            notification,
            object,
        })
    }

    pub fn bucket_name(&self) -> Remote<String> {
        self.bucket.output(|b| b.name.clone())
    }

    /// The instance's named outputs.
    pub fn outputs(&self) -> BTreeMap<&'static str, Remote<String>> {
        BTreeMap::from([
            ("bucketName", self.bucket.output(|b| b.name.clone())),
            ("iamPolicy", self.policy.output(|p| p.policy_name.clone())),
            ("iamRole", self.role.output(|r| r.name.clone())),
            ("allowBucket", self.permission.output(|p| p.source_arn.clone())),
            (
                "bucketNotification",
                self.notification.output(|n| n.configuration_id.clone()),
            ),
            ("lambdaFunction", self.function.output(|f| f.name.clone())),
            ("s3Object", self.object.output(|o| o.key.clone())),
        ])
    }
}

#[cfg(test)]
mod test {
    use formant::Action;
    use pretty_assertions::assert_eq;

    use super::*;

    fn tmpdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("pipeline-infra-test")
            .join(format!("{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn params(name: &str) -> PipelineParams {
        PipelineParams {
            name: name.to_owned(),
            policy_kind: PolicyKind::DynamoDb,
            source: FunctionSource {
                code_path: "alpha.zip".into(),
                handler: "bootstrap".to_owned(),
                runtime: "provided.al2023".to_owned(),
            },
            environment: BTreeMap::from([("EVENTS_TABLE".to_owned(), "T".into())]),
        }
    }

    #[test]
    fn declares_seven_owned_resources() {
        let dir = tmpdir("declares_seven_owned_resources");
        let cfg = SdkConfig::builder().build();
        let mut stack = Stack::new(&dir, cfg).unwrap();

        let pipeline = EventPipeline::declare(&mut stack, params("alpha")).unwrap();

        let children = stack.children_of("alpha");
        assert_eq!(7, children.len());
        for child in &children {
            assert!(
                child.starts_with("alpha-"),
                "'{child}' is not prefixed with the instance name"
            );
            assert_eq!(Some("alpha".to_owned()), stack.parent_of(child));
        }

        assert!(stack
            .dependencies_of("alpha-notification")
            .unwrap()
            .contains(&"alpha-permission".to_owned()));
        assert!(stack
            .dependencies_of("alpha-object")
            .unwrap()
            .contains(&"alpha-notification".to_owned()));

        let outputs = pipeline.outputs();
        assert_eq!(
            vec![
                "allowBucket",
                "bucketName",
                "bucketNotification",
                "iamPolicy",
                "iamRole",
                "lambdaFunction",
                "s3Object"
            ],
            outputs.keys().copied().collect::<Vec<_>>()
        );

        let plan = stack.plan().unwrap();
        assert!(plan.actions.iter().all(|a| a.action == Action::Create));
        let step = |id: &str| {
            plan.actions
                .iter()
                .find(|a| a.id == id)
                .unwrap_or_else(|| panic!("'{id}' is not in the plan"))
                .step
        };
        assert!(step("alpha-permission") < step("alpha-notification"));
        assert!(step("alpha-notification") < step("alpha-object"));
        assert!(step("alpha-role") < step("alpha-policy"));
        assert!(step("alpha-role") < step("alpha-function"));
    }

    #[test]
    fn rejects_an_empty_instance_name() {
        let dir = tmpdir("rejects_an_empty_instance_name");
        let cfg = SdkConfig::builder().build();
        let mut stack = Stack::new(&dir, cfg).unwrap();

        let result = EventPipeline::declare(&mut stack, params(""));
        assert!(matches!(result, Err(formant::Error::EmptyName)));
    }

    #[test]
    fn rejects_a_duplicate_instance_name() {
        let dir = tmpdir("rejects_a_duplicate_instance_name");
        let cfg = SdkConfig::builder().build();
        let mut stack = Stack::new(&dir, cfg).unwrap();

        let _first = EventPipeline::declare(&mut stack, params("alpha")).unwrap();
        let result = EventPipeline::declare(&mut stack, params("alpha"));
        assert!(matches!(
            result,
            Err(formant::Error::DuplicateName { .. })
        ));
    }
}
