//! Writes a row into the events table for every object created in the
//! bucket. The table name comes from the `EVENTS_TABLE` environment
//! variable.
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use pipeline_fn::{ingest, DynamoDbSink, StorageEvent};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .init();

    let table = std::env::var("EVENTS_TABLE")?;
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sink = DynamoDbSink::new(&cfg);
    let sink = &sink;
    let table = table.as_str();

    run(service_fn(move |event: LambdaEvent<StorageEvent>| async move {
        ingest(&event.payload, sink, table)
            .await
            .map_err(Error::from)
    }))
    .await
}
