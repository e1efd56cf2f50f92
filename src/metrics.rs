//! Append-only CSV metrics sink.
//!
//! A single writer task owns the log file; connection handlers send finished
//! session aggregates through a clonable channel handle. Routing every
//! append through one task keeps concurrent sessions from interleaving
//! partial rows. There is no ordering guarantee on rows across connections.
//!
//! The file is created lazily with its header row on the first append; a
//! server that serves no requests leaves no file behind.

use crate::config::ScenarioParams;
use crate::session::SessionSummary;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Column order of the metrics log.
pub const CSV_COLUMNS: [&str; 10] = [
    "client_id",
    "message_id",
    "server_id",
    "client_send_time",
    "server_processing_time",
    "client_receive_time",
    "response_time",
    "num_servers",
    "num_clients",
    "num_messages",
];

/// One pending row of the metrics log.
///
/// The remaining columns (node identity, receive time, round-trip time,
/// scenario counters) are filled in by the writer at append time.
#[derive(Debug, Clone)]
pub struct MetricsRecord {
    pub client_id: String,
    pub message_id: String,
    pub client_send_time: f64,
    pub server_processing_time: f64,
}

impl From<SessionSummary> for MetricsRecord {
    fn from(summary: SessionSummary) -> Self {
        MetricsRecord {
            client_id: summary.client_id,
            // the aggregated message count doubles as the row's identifier
            message_id: summary.messages_processed.to_string(),
            client_send_time: summary.first_send_timestamp,
            server_processing_time: summary.avg_processing_time,
        }
    }
}

/// Handle for appending records to the metrics log.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    tx: mpsc::UnboundedSender<MetricsRecord>,
}

impl MetricsSink {
    /// Spawn the writer task and return a handle to it.
    pub fn spawn(path: PathBuf, server_id: String, scenario: ScenarioParams) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path, server_id, scenario, rx));
        MetricsSink { tx }
    }

    /// Queue one record for appending.
    ///
    /// Best effort: a failed write downstream is logged by the writer and
    /// the record dropped, never retried.
    pub fn append(&self, record: MetricsRecord) {
        if self.tx.send(record).is_err() {
            warn!("Metrics writer is gone, dropping record");
        }
    }
}

/// Seconds since the unix epoch as a float, the timestamp form used on the
/// wire and in the log.
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn writer_task(
    path: PathBuf,
    server_id: String,
    scenario: ScenarioParams,
    mut rx: mpsc::UnboundedReceiver<MetricsRecord>,
) {
    let mut file: Option<File> = None;

    while let Some(record) = rx.recv().await {
        if file.is_none() {
            match open_log(&path).await {
                Ok(f) => file = Some(f),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to open metrics log, dropping record");
                    continue;
                }
            }
        }

        let row = format_row(&record, &server_id, &scenario);
        if let Some(f) = file.as_mut() {
            if let Err(e) = append_row(f, &row).await {
                warn!(path = %path.display(), error = %e, "Failed to append metrics row, dropping record");
            }
        }
    }

    debug!(path = %path.display(), "Metrics writer stopping");
}

/// Open the log for appending, writing the header row if the file is new or
/// empty.
async fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;

    if file.metadata().await?.len() == 0 {
        file.write_all(CSV_COLUMNS.join(",").as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
    }

    Ok(file)
}

async fn append_row(file: &mut File, row: &str) -> std::io::Result<()> {
    file.write_all(row.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

/// Format one CSV row. Receive and round-trip times are derived here, at
/// append time, from the wall clock.
fn format_row(record: &MetricsRecord, server_id: &str, scenario: &ScenarioParams) -> String {
    let client_receive_time = unix_time_secs();
    let response_time = client_receive_time - record.client_send_time;

    [
        csv_field(&record.client_id),
        csv_field(&record.message_id),
        csv_field(server_id),
        format!("{:.6}", record.client_send_time),
        format!("{:.6}", record.server_processing_time),
        format!("{:.6}", client_receive_time),
        format!("{:.6}", response_time),
        csv_field(&scenario.num_servers),
        csv_field(&scenario.num_clients),
        csv_field(&scenario.num_messages),
    ]
    .join(",")
}

/// Quote a field when it would otherwise break the row layout.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSummary;
    use std::time::Duration;

    fn scenario() -> ScenarioParams {
        ScenarioParams {
            num_servers: "2".to_string(),
            num_clients: "4".to_string(),
            num_messages: "100".to_string(),
        }
    }

    #[test]
    fn test_record_from_summary() {
        let record = MetricsRecord::from(SessionSummary {
            client_id: "c1".to_string(),
            messages_processed: 7,
            first_send_timestamp: 1000.5,
            avg_processing_time: 0.001,
        });

        assert_eq!(record.client_id, "c1");
        assert_eq!(record.message_id, "7");
        assert_eq!(record.client_send_time, 1000.5);
        assert_eq!(record.server_processing_time, 0.001);
    }

    #[test]
    fn test_row_has_ten_fields() {
        let record = MetricsRecord {
            client_id: "c1".to_string(),
            message_id: "3".to_string(),
            client_send_time: 1000.0,
            server_processing_time: 0.001,
        };

        let row = format_row(&record, "node-a", &scenario());
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields.len(), 10);
        assert_eq!(fields[0], "c1");
        assert_eq!(fields[1], "3");
        assert_eq!(fields[2], "node-a");
        assert_eq!(fields[4], "0.001000");
        assert_eq!(&fields[7..], ["2", "4", "100"]);
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn test_writer_creates_file_with_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.csv");

        let sink = MetricsSink::spawn(path.clone(), "node-a".to_string(), scenario());
        for i in 0..2 {
            sink.append(MetricsRecord {
                client_id: format!("c{}", i),
                message_id: "1".to_string(),
                client_send_time: 1000.0,
                server_processing_time: 0.001,
            });
        }

        let contents = wait_for_lines(&path, 3).await;
        assert_eq!(contents[0], CSV_COLUMNS.join(","));
        assert!(contents[1].starts_with("c0,"));
        assert!(contents[2].starts_with("c1,"));
    }

    #[tokio::test]
    async fn test_no_file_until_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.csv");

        let _sink = MetricsSink::spawn(path.clone(), "node-a".to_string(), scenario());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!path.exists());
    }

    async fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
        for _ in 0..100 {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let lines: Vec<String> = contents.lines().map(|l| l.to_string()).collect();
                if lines.len() >= expected {
                    return lines;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} lines in {}", expected, path.display());
    }
}
