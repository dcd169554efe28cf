//! Execution-role policy resolution.
//!
//! Every function role gets exactly one capability statement, chosen by
//! [`PolicyKind`], followed by the fixed logging statements. The capability
//! table is closed: adding a kind means adding an enum variant and a table
//! entry, and the compiler points at every call site that must choose.
use std::{collections::HashMap, sync::LazyLock};

use formant::aws::iam::{Effect, PolicyDocument, Statement};

/// What a function's execution role is allowed to do besides logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// Write items into DynamoDB tables.
    DynamoDb,
    /// Create SageMaker data-quality job definitions.
    SageMaker,
}

static CAPABILITIES: LazyLock<HashMap<PolicyKind, Statement>> = LazyLock::new(|| {
    HashMap::from([
        (
            PolicyKind::DynamoDb,
            Statement {
                sid: None,
                effect: Effect::Allow,
                action: vec!["dynamodb:PutItem".to_owned()],
                resource: vec!["arn:aws:dynamodb:*:*:table/*".to_owned()],
            },
        ),
        (
            PolicyKind::SageMaker,
            Statement {
                sid: None,
                effect: Effect::Allow,
                action: vec!["sagemaker:CreateDataQualityJobDefinition".to_owned()],
                resource: vec!["*".to_owned()],
            },
        ),
    ])
});

fn logging_statements() -> [Statement; 2] {
    [
        Statement {
            sid: None,
            effect: Effect::Allow,
            action: vec!["logs:CreateLogGroup".to_owned()],
            resource: vec!["arn:aws:logs:*:*:*".to_owned()],
        },
        Statement {
            sid: None,
            effect: Effect::Allow,
            action: vec![
                "logs:CreateLogStream".to_owned(),
                "logs:PutLogEvents".to_owned(),
            ],
            resource: vec!["arn:aws:logs:*:*:log-group:/aws/lambda/*:*".to_owned()],
        },
    ]
}

/// The full execution-role policy for a kind: its capability statement
/// followed by the two logging statements.
pub fn resolve_policy(kind: PolicyKind) -> PolicyDocument {
    let capability = CAPABILITIES
        .get(&kind)
        .expect("every policy kind has a capability entry")
        .clone();
    let [log_group, log_events] = logging_statements();
    PolicyDocument::new(vec![capability, log_group, log_events])
}

/// The trust policy letting Lambda assume an execution role.
pub fn lambda_trust_document() -> serde_json::Value {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "lambda.amazonaws.com" },
            "Action": "sts:AssumeRole"
        }]
    })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn every_policy_is_capability_then_logging() {
        for kind in [PolicyKind::DynamoDb, PolicyKind::SageMaker] {
            let doc = resolve_policy(kind);
            assert_eq!("2012-10-17", doc.version);
            assert_eq!(3, doc.statement.len());
            assert_eq!(vec!["logs:CreateLogGroup".to_owned()], doc.statement[1].action);
            assert_eq!(
                vec!["arn:aws:logs:*:*:*".to_owned()],
                doc.statement[1].resource
            );
            assert_eq!(
                vec![
                    "logs:CreateLogStream".to_owned(),
                    "logs:PutLogEvents".to_owned()
                ],
                doc.statement[2].action
            );
            assert_eq!(
                vec!["arn:aws:logs:*:*:log-group:/aws/lambda/*:*".to_owned()],
                doc.statement[2].resource
            );
        }
    }

    #[test]
    fn dynamodb_policy_grants_put_item_and_nothing_sagemaker() {
        let doc = resolve_policy(PolicyKind::DynamoDb);
        assert!(doc.statement[0]
            .action
            .contains(&"dynamodb:PutItem".to_owned()));
        assert!(doc
            .statement
            .iter()
            .flat_map(|s| s.action.iter())
            .all(|action| !action.starts_with("sagemaker:")));
    }

    #[test]
    fn sagemaker_policy_grants_exactly_one_action() {
        let doc = resolve_policy(PolicyKind::SageMaker);
        assert_eq!(
            vec!["sagemaker:CreateDataQualityJobDefinition".to_owned()],
            doc.statement[0].action
        );
    }

    #[test]
    fn trust_document_names_the_lambda_service() {
        let doc = lambda_trust_document();
        assert_eq!(
            serde_json::json!("lambda.amazonaws.com"),
            doc["Statement"][0]["Principal"]["Service"]
        );
        assert_eq!(serde_json::json!("sts:AssumeRole"), doc["Statement"][0]["Action"]);
    }
}
