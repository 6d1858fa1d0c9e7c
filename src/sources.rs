//! Dataset sources: construction from config, shared file-reading plumbing,
//! and the `backfill datasets` health listing.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use futures::SinkExt;
use serde_json::Value;

use backfill_harness_core::period;
use backfill_harness_core::source::Source;
use backfill_harness_core::transform::RecordTransform;

use crate::config::{Config, DatasetConfig, SourceFormat};
use crate::connector_csv::CsvSource;
use crate::connector_jsonl::JsonlSource;

/// Records buffered between the blocking reader and the async consumer.
const STREAM_BUFFER: usize = 256;

/// Sending half handed to a blocking producer.
pub struct Emitter<T> {
    tx: mpsc::Sender<Result<T>>,
}

impl<T> Emitter<T> {
    /// Blocks until the consumer has room. Returns `false` once the
    /// consumer is gone, so the producer can stop reading.
    pub fn send(&mut self, item: Result<T>) -> bool {
        futures::executor::block_on(self.tx.send(item)).is_ok()
    }
}

/// Run `produce` on the blocking pool and expose what it emits as a lazy,
/// bounded stream. An error returned by `produce` becomes the last item.
pub fn blocking_stream<T, F>(produce: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnOnce(&mut Emitter<T>) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::task::spawn_blocking(move || {
        let mut emitter = Emitter { tx };
        if let Err(e) = produce(&mut emitter) {
            emitter.send(Err(e));
        }
    });
    rx.boxed()
}

/// Interpret a field value as a timestamp: strings via
/// [`period::parse_timestamp`], integers as Unix epochs.
pub fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => period::parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(period::parse_epoch),
        _ => None,
    }
}

pub fn build_source(dataset: &DatasetConfig) -> Arc<dyn Source> {
    match dataset.format {
        SourceFormat::Csv => Arc::new(CsvSource::new(
            dataset.path.clone(),
            dataset.timestamp_field.clone(),
        )),
        SourceFormat::Jsonl => Arc::new(JsonlSource::new(
            dataset.path.clone(),
            dataset.timestamp_field.clone(),
        )),
    }
}

pub fn build_transform(dataset: &DatasetConfig) -> Result<RecordTransform> {
    RecordTransform::new(dataset.key_fields.clone(), dataset.required_fields.clone())
}

pub fn list_datasets(config: &Config) -> Result<()> {
    if config.datasets.is_empty() {
        println!("No datasets configured. Add [datasets.<name>] sections to the config file.");
        return Ok(());
    }

    println!(
        "{:<20} {:<7} {:<10} {:<16} PATH",
        "DATASET", "FORMAT", "STATUS", "KEY"
    );
    for (name, dataset) in &config.datasets {
        let status = if dataset.path.is_file() {
            "OK"
        } else {
            "MISSING"
        };
        println!(
            "{:<20} {:<7} {:<10} {:<16} {}",
            name,
            dataset.format.as_str(),
            status,
            dataset.key_fields.join("+"),
            dataset.path.display()
        );
    }
    Ok(())
}
