//! Provisions the object-ingestion pipeline.
//!
//! Two pipeline instances share one events table: `ingest` writes a record
//! for every object created in its bucket, and `greeter` only logs. Run
//! `infra plan` to see what an apply would do, `infra apply` to realize it,
//! and `infra destroy` to tear everything down.
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use formant::{
    aws::dynamodb::{AttributeType, BillingMode, GlobalIndex, KeyAttribute, Projection, Table},
    Stack,
};

mod component;
mod policy;

use component::{EventPipeline, FunctionSource, PipelineParams};
use policy::PolicyKind;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Directory holding the deployment state file.
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,

    /// Directory holding the zipped function artifacts.
    #[arg(long, default_value = "artifacts")]
    artifacts_dir: PathBuf,

    /// Logging directives, eg "debug" or "formant=debug".
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what an apply would do, without touching anything.
    Plan,
    /// Realize the declared infrastructure and print the outputs.
    Apply,
    /// Destroy everything in the deployment state.
    Destroy {
        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
}

fn source(artifacts_dir: &Path, artifact: &str) -> FunctionSource {
    FunctionSource {
        code_path: artifacts_dir.join(artifact),
        handler: "bootstrap".to_owned(),
        runtime: "provided.al2023".to_owned(),
    }
}

/// Declare the whole deployment: the shared events table and the two
/// pipeline instances.
fn declare_infra(
    stack: &mut Stack<aws_config::SdkConfig>,
    artifacts_dir: &Path,
) -> anyhow::Result<()> {
    let events_table = stack.resource(
        "ingest-events",
        Table {
            name: "ingest-events".to_owned(),
            key_schema: vec![KeyAttribute::partition("RequestId", AttributeType::String)],
            global_secondary_indexes: vec![GlobalIndex {
                name: "key-time-index".to_owned(),
                key_schema: vec![
                    KeyAttribute::partition("ObjectKey", AttributeType::String),
                    KeyAttribute::sort("EventTime", AttributeType::String),
                ],
                projection: Projection::Include {
                    non_key_attributes: vec!["RequestId".to_owned()],
                },
            }],
            billing_mode: BillingMode::PayPerRequest,
        },
    )?;

    let ingest = EventPipeline::declare(
        stack,
        PipelineParams {
            name: "ingest".to_owned(),
            policy_kind: PolicyKind::DynamoDb,
            source: source(artifacts_dir, "ingest.zip"),
            environment: BTreeMap::from([(
                "EVENTS_TABLE".to_owned(),
                events_table.output(|t| t.name.clone()),
            )]),
        },
    )?;

    let greeter = EventPipeline::declare(
        stack,
        PipelineParams {
            name: "greeter".to_owned(),
            policy_kind: PolicyKind::SageMaker,
            source: source(artifacts_dir, "greeter.zip"),
            environment: BTreeMap::default(),
        },
    )?;

    stack.export("ingestBucketName", ingest.bucket_name());
    stack.export("greeterBucketName", greeter.bucket_name());
    stack.export("eventsTableName", events_table.output(|t| t.name.clone()));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new().parse_filters(&cli.log).init();

    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let mut stack = Stack::new(&cli.state_dir, cfg)?;

    match cli.command {
        Command::Plan => {
            declare_infra(&mut stack, &cli.artifacts_dir)?;
            let plan = stack.plan()?;
            println!("{plan}");
        }
        Command::Apply => {
            declare_infra(&mut stack, &cli.artifacts_dir)?;
            let plan = stack.plan()?;
            println!("{plan}");
            let outputs = stack.apply(plan).await?;
            for (name, value) in outputs {
                println!("{name} = {value}");
            }
        }
        Command::Destroy { force } => {
            // Declaring first registers the deleter for every resource type.
            declare_infra(&mut stack, &cli.artifacts_dir)?;
            let plan = stack.teardown()?;
            println!("{plan}");
            if plan.is_empty() {
                return Ok(());
            }
            if !force {
                print!("Destroy all of the above? Only 'yes' continues: ");
                std::io::stdout().flush()?;
                let mut answer = String::new();
                std::io::stdin().read_line(&mut answer)?;
                if answer.trim() != "yes" {
                    println!("Aborted.");
                    return Ok(());
                }
            }
            stack.apply(plan).await?;
            log::info!("deployment destroyed");
        }
    }
    Ok(())
}
