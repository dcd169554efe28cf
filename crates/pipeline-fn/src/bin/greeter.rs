//! Greets the log stream and does nothing else.
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use pipeline_fn::{greet, StorageEvent};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .init();

    run(service_fn(|event: LambdaEvent<StorageEvent>| async move {
        greet(&event.payload);
        Ok::<(), Error>(())
    }))
    .await
}
