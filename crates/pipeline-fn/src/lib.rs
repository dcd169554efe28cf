//! Function payloads for the object-ingestion pipeline.
//!
//! Two handlers share the S3 event model here: [`ingest`] writes one row per
//! object-created record into the events table, and [`greet`] only logs.
use std::collections::HashMap;

use anyhow::Context;
use aws_sdk_dynamodb::types::AttributeValue;

/// The notification payload S3 delivers to the function.
///
/// Only the fields the handlers read are modeled; serde drops the rest.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct StorageEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<StorageRecord>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StorageRecord {
    /// Event timestamp as S3 formatted it, kept verbatim.
    #[serde(rename = "eventTime")]
    pub event_time: String,
    #[serde(rename = "responseElements", default)]
    pub response_elements: HashMap<String, String>,
    pub s3: StorageEntity,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StorageEntity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ObjectEntity {
    pub key: String,
}

/// One row destined for the events table.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRecord {
    pub request_id: String,
    pub object_key: String,
    pub event_time: String,
}

impl ObjectRecord {
    pub fn from_record(record: &StorageRecord) -> anyhow::Result<Self> {
        let request_id = record
            .response_elements
            .get("x-amz-request-id")
            .context("record carries no x-amz-request-id")?
            .clone();
        Ok(ObjectRecord {
            request_id,
            object_key: record.s3.object.key.clone(),
            event_time: record.event_time.clone(),
        })
    }
}

/// Where ingested records go. Abstracted so tests can record writes.
pub trait RecordSink {
    fn put(
        &self,
        table: &str,
        record: &ObjectRecord,
    ) -> impl std::future::Future<Output = anyhow::Result<()>>;
}

/// Writes records into a DynamoDB table.
pub struct DynamoDbSink {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoDbSink {
    pub fn new(cfg: &aws_config::SdkConfig) -> Self {
        DynamoDbSink {
            client: aws_sdk_dynamodb::Client::new(cfg),
        }
    }
}

impl RecordSink for DynamoDbSink {
    async fn put(&self, table: &str, record: &ObjectRecord) -> anyhow::Result<()> {
        // A plain put keyed on the request id: a redelivered event with the
        // same id silently overwrites the previous item.
        self.client
            .put_item()
            .table_name(table)
            .item("RequestId", AttributeValue::S(record.request_id.clone()))
            .item("ObjectKey", AttributeValue::S(record.object_key.clone()))
            .item("EventTime", AttributeValue::S(record.event_time.clone()))
            .send()
            .await?;
        Ok(())
    }
}

/// Write one row per record into `table`.
///
/// A failed write is logged with everything needed to find the lost record,
/// then re-raised so the runtime marks the invocation failed and S3 retries
/// delivery.
pub async fn ingest<S: RecordSink>(
    event: &StorageEvent,
    sink: &S,
    table: &str,
) -> anyhow::Result<()> {
    for record in event.records.iter() {
        let row = ObjectRecord::from_record(record)?;
        if let Err(error) = sink.put(table, &row).await {
            tracing::error!(
                request_id = %row.request_id,
                object_key = %row.object_key,
                event_time = %row.event_time,
                table,
                "failed to store object record: {error:#}"
            );
            return Err(error);
        }
        tracing::info!(object_key = %row.object_key, "stored object record");
    }
    Ok(())
}

/// The greeter ignores its event entirely.
pub fn greet(_event: &StorageEvent) {
    tracing::info!("hello there");
    tracing::info!("GeNeRaL kEnObI");
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_event() -> StorageEvent {
        serde_json::from_value(serde_json::json!({
            "Records": [{
                "eventTime": "2024-01-01T00:00:00Z",
                "responseElements": { "x-amz-request-id": "req-1" },
                "s3": {
                    "bucket": { "name": "ingest-bucket" },
                    "object": { "key": "foo.txt" }
                }
            }]
        }))
        .unwrap()
    }

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(String, ObjectRecord)>>,
    }

    impl RecordSink for RecordingSink {
        async fn put(&self, table: &str, record: &ObjectRecord) -> anyhow::Result<()> {
            self.writes
                .lock()
                .unwrap()
                .push((table.to_owned(), record.clone()));
            Ok(())
        }
    }

    struct FailingSink;

    impl RecordSink for FailingSink {
        async fn put(&self, _table: &str, _record: &ObjectRecord) -> anyhow::Result<()> {
            anyhow::bail!("the table is unavailable")
        }
    }

    #[test]
    fn object_record_is_read_from_the_event() {
        let event = sample_event();
        let row = ObjectRecord::from_record(&event.records[0]).unwrap();
        assert_eq!(
            ObjectRecord {
                request_id: "req-1".to_owned(),
                object_key: "foo.txt".to_owned(),
                event_time: "2024-01-01T00:00:00Z".to_owned(),
            },
            row
        );
    }

    #[test]
    fn a_record_without_a_request_id_is_an_error() {
        let mut event = sample_event();
        event.records[0].response_elements.clear();
        assert!(ObjectRecord::from_record(&event.records[0]).is_err());
    }

    #[tokio::test]
    async fn ingest_writes_exactly_one_row() {
        let sink = RecordingSink::default();
        ingest(&sample_event(), &sink, "T").await.unwrap();

        let writes = sink.writes.lock().unwrap();
        assert_eq!(1, writes.len());
        let (table, row) = &writes[0];
        assert_eq!("T", table);
        assert_eq!("req-1", row.request_id);
        assert_eq!("foo.txt", row.object_key);
        assert_eq!("2024-01-01T00:00:00Z", row.event_time);
    }

    #[tokio::test]
    async fn ingest_reraises_sink_failures() {
        let result = ingest(&sample_event(), &FailingSink, "T").await;
        let error = result.unwrap_err();
        assert!(error.to_string().contains("unavailable"));
    }

    #[derive(Clone, Default)]
    struct Capture {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl Capture {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.buffer.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(|line| line.trim().to_owned())
                .collect()
        }
    }

    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Capture {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            CaptureWriter(self.buffer.clone())
        }
    }

    #[test]
    fn greeter_logs_the_two_lines_and_nothing_else() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_level(false)
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .finish();

        tracing::subscriber::with_default(subscriber, || greet(&StorageEvent::default()));

        assert_eq!(
            vec!["hello there".to_owned(), "GeNeRaL kEnObI".to_owned()],
            capture.lines()
        );
    }
}
