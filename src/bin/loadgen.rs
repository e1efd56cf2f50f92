//! Load generator for the wirebench server.
//!
//! Sends each message on its own connection, the way the benchmark scenario
//! drives real servers: one framed request, one response, then a CLOSE
//! frame. Prints aggregate round-trip latency when done.

use clap::Parser;
use std::process;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::warn;
use wirebench::metrics::unix_time_secs;
use wirebench::protocol::{self, MessageId, MsgType, RequestPayload, ResponsePayload};

/// Command-line arguments for the load generator.
#[derive(Parser, Debug)]
#[command(name = "loadgen")]
#[command(version = "0.1.0")]
#[command(about = "Drive a wirebench server and report round-trip latency", long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    server: String,

    /// Number of messages to send
    #[arg(short = 'n', long, default_value_t = 5)]
    messages: u64,

    /// Maximum concurrent in-flight messages
    #[arg(short = 'w', long, default_value_t = 10)]
    workers: usize,

    /// Payload text carried in each request
    #[arg(long, default_value = "Hello from wirebench loadgen")]
    data: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let args = Args::parse();
    let client_id = format!("client_{}", process::id());

    println!("Sending {} messages to {} ({} workers)", args.messages, args.server, args.workers);

    let limit = Arc::new(Semaphore::new(args.workers));
    let mut handles = Vec::with_capacity(args.messages as usize);
    let started = Instant::now();

    for message_number in 1..=args.messages {
        let permit = limit.clone().acquire_owned().await?;
        let server = args.server.clone();
        let client_id = client_id.clone();
        let data = args.data.clone();

        handles.push(tokio::spawn(async move {
            let result = send_one(&server, &client_id, message_number, &data).await;
            drop(permit);
            result
        }));
    }

    let mut latencies = Vec::new();
    let mut failures = 0u64;
    for handle in handles {
        match handle.await {
            Ok(Ok(rtt)) => latencies.push(rtt),
            Ok(Err(e)) => {
                failures += 1;
                warn!(error = %e, "Request failed");
            }
            Err(e) => {
                failures += 1;
                warn!(error = %e, "Worker panicked");
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    println!("Done in {:.3}s: {} ok, {} failed", elapsed, latencies.len(), failures);

    if !latencies.is_empty() {
        let min = latencies.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = latencies.iter().cloned().fold(0.0, f64::max);
        let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
        println!(
            "Round-trip latency: min {:.3}ms / avg {:.3}ms / max {:.3}ms",
            min * 1000.0,
            avg * 1000.0,
            max * 1000.0
        );
    }

    Ok(())
}

/// Send one request on a fresh connection and return its round-trip time in
/// seconds.
async fn send_one(
    server: &str,
    client_id: &str,
    message_number: u64,
    data: &str,
) -> Result<f64, Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = TcpStream::connect(server).await?;
    let started = Instant::now();

    let request = RequestPayload {
        client_id: client_id.to_string(),
        message_id: MessageId::Numeric(message_number as i64),
        timestamp: unix_time_secs(),
        data: data.to_string(),
    };
    let body = serde_json::to_vec(&request)?;
    protocol::write_frame(&mut stream, MsgType::Request, &body).await?;

    let (header, payload) = protocol::read_frame(&mut stream).await?;
    if header.msg_type != MsgType::Response {
        return Err(format!("unexpected frame type {:?}", header.msg_type).into());
    }
    let response: ResponsePayload = serde_json::from_slice(&payload)?;
    if response.status != "success" {
        return Err(format!("server reported status {:?}", response.status).into());
    }
    let rtt = started.elapsed().as_secs_f64();

    // empty payloads are rejected by the framing rules, so CLOSE carries {}
    protocol::write_frame(&mut stream, MsgType::Close, b"{}").await?;

    Ok(rtt)
}
