//! TCP server and per-connection message loop.
//!
//! One task per accepted connection, bounded by a semaphore. Each task
//! frames the byte stream, answers requests after a simulated processing
//! delay, and flushes its session aggregate to the metrics sink when the
//! connection ends, whether by CLOSE frame, EOF, or protocol error.

use crate::config::Config;
use crate::metrics::{MetricsRecord, MetricsSink};
use crate::protocol::{self, FrameError, MsgType, RequestPayload, ResponsePayload};
use crate::session::Session;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 10000;

/// Server instance
pub struct Server {
    config: Config,
    metrics: MetricsSink,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a server, spawning its metrics writer.
    pub fn new(config: Config) -> Self {
        let metrics = MetricsSink::spawn(
            config.metrics_path(),
            config.server_id.clone(),
            config.scenario.clone(),
        );

        Server {
            config,
            metrics,
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Bind the configured address and accept connections until shut down.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(
            address = %self.config.listen,
            metrics = %self.config.metrics_path().display(),
            "Server listening"
        );
        self.serve(listener)
            .await
            .map_err(|e| -> Box<dyn std::error::Error> { e })
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let metrics = self.metrics.clone();
                    let server_id = self.config.server_id.clone();
                    let delay = Duration::from_millis(self.config.processing_delay_ms);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, metrics, server_id, delay).await
                        {
                            debug!(peer = %addr, error = %e, "Connection ended with error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Run the message loop for one connection and flush its session aggregate.
///
/// Error, EOF, and explicit CLOSE all land here; a session that served at
/// least one request is flushed exactly once, zero-request sessions never.
async fn handle_connection<S>(
    mut stream: S,
    metrics: MetricsSink,
    server_id: String,
    processing_delay: Duration,
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new();
    let result = message_loop(&mut stream, &mut session, &server_id, processing_delay).await;

    if let Some(summary) = session.finish() {
        trace!(
            client_id = %summary.client_id,
            messages = summary.messages_processed,
            "Flushing session aggregate"
        );
        metrics.append(MetricsRecord::from(summary));
    }

    match result {
        // A clean end-of-stream between frames is a normal disconnect.
        Err(FrameError::ConnectionClosed) => Ok(()),
        other => other,
    }
}

/// Read and answer frames until the peer disconnects, asks to close, or
/// violates the protocol.
async fn message_loop<S>(
    stream: &mut S,
    session: &mut Session,
    server_id: &str,
    processing_delay: Duration,
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (header, payload) = protocol::read_frame(stream).await?;
        trace!(msg_type = ?header.msg_type, payload_len = header.payload_len, "Frame received");

        match header.msg_type {
            MsgType::Request => {
                let start = Instant::now();

                let request: RequestPayload = match serde_json::from_slice(&payload) {
                    Ok(request) => request,
                    Err(e) => {
                        // Recoverable: skip this message, keep the connection.
                        warn!(error = %e, "Malformed request payload, skipping");
                        continue;
                    }
                };

                // Simulated work stands in for real request processing.
                tokio::time::sleep(processing_delay).await;
                let processing_time = start.elapsed().as_secs_f64();

                session.record_request(&request.client_id, request.timestamp, processing_time);

                let response = ResponsePayload {
                    status: "success".to_string(),
                    server_id: server_id.to_string(),
                    processing_time,
                    response_message: format!("Response from server {}", server_id),
                };
                let body = match serde_json::to_vec(&response) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode response, skipping");
                        continue;
                    }
                };

                protocol::write_frame(stream, MsgType::Response, &body).await?;
            }

            MsgType::Close => {
                debug!("Peer requested close");
                return Ok(());
            }

            // A response frame is never valid server-bound traffic.
            MsgType::Response => {
                return Err(FrameError::UnsupportedType(MsgType::Response.as_u32()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioParams;
    use crate::protocol::{encode_frame, MAGIC};
    use bytes::{BufMut, BytesMut};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_sink(dir: &TempDir) -> (MetricsSink, std::path::PathBuf) {
        let path = dir.path().join("requests.csv");
        let sink = MetricsSink::spawn(
            path.clone(),
            "node-a".to_string(),
            ScenarioParams {
                num_servers: "1".to_string(),
                num_clients: "1".to_string(),
                num_messages: "1".to_string(),
            },
        );
        (sink, path)
    }

    const REQUEST_BODY: &[u8] =
        br#"{"client_id":"c1","message_id":"m1","timestamp":1000.0,"data":"x"}"#;

    #[tokio::test]
    async fn test_request_gets_response() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = test_sink(&dir);
        let (mut client, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server_side,
            sink,
            "node-a".to_string(),
            Duration::from_millis(0),
        ));

        client
            .write_all(&encode_frame(MsgType::Request, REQUEST_BODY))
            .await
            .unwrap();

        let (header, payload) = protocol::read_frame(&mut client).await.unwrap();
        assert_eq!(header.msg_type, MsgType::Response);
        assert_eq!(header.payload_len as usize, payload.len());

        let response: ResponsePayload = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response.status, "success");
        assert_eq!(response.server_id, "node-a");
        assert!(response.processing_time >= 0.0);

        client
            .write_all(&encode_frame(MsgType::Close, b"{}"))
            .await
            .unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_magic_closes_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = test_sink(&dir);
        let (mut client, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server_side,
            sink,
            "node-a".to_string(),
            Duration::from_millis(0),
        ));

        let mut header = BytesMut::new();
        header.put_u32(MAGIC ^ 1);
        header.put_u32(1);
        header.put_u32(2);
        client.write_all(&header).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::ProtocolMismatch { .. }));

        // nothing was written back and no metrics record was flushed
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_payload_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = test_sink(&dir);
        let (mut client, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server_side,
            sink,
            "node-a".to_string(),
            Duration::from_millis(0),
        ));

        // garbage first, then a valid request; only the latter is answered
        client
            .write_all(&encode_frame(MsgType::Request, b"not json"))
            .await
            .unwrap();
        client
            .write_all(&encode_frame(MsgType::Request, REQUEST_BODY))
            .await
            .unwrap();

        let (header, payload) = protocol::read_frame(&mut client).await.unwrap();
        assert_eq!(header.msg_type, MsgType::Response);
        let response: ResponsePayload = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response.status, "success");

        client
            .write_all(&encode_frame(MsgType::Close, b"{}"))
            .await
            .unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inbound_response_frame_is_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = test_sink(&dir);
        let (mut client, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server_side,
            sink,
            "node-a".to_string(),
            Duration::from_millis(0),
        ));

        client
            .write_all(&encode_frame(MsgType::Response, b"{}"))
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedType(2)));
    }

    #[tokio::test]
    async fn test_close_without_requests_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = test_sink(&dir);
        let (mut client, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server_side,
            sink,
            "node-a".to_string(),
            Duration::from_millis(0),
        ));

        client
            .write_all(&encode_frame(MsgType::Close, b"{}"))
            .await
            .unwrap();
        task.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!path.exists());
    }
}
