use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::GatewayError;
use crate::mcp::protocol;
use crate::mcp::{ClientContext, Dispatcher};

/// Line-delimited JSON-RPC over stdin/stdout.
///
/// One JSON value per line each way; stdout is owned by a single writer
/// task so responses and notifications never interleave mid-line. All
/// logging goes to stderr.
pub async fn run(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let client_id = dispatcher.bus().register_client();

    let (out_tx, mut out_rx) = mpsc::channel::<Value>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    // Server-pushed notifications flow through the client sink into the
    // same writer.
    let queue = dispatcher.config().sse_queue_maxsize;
    let (note_tx, mut note_rx) = mpsc::channel::<Value>(queue.max(1));
    let note_out = out_tx.clone();
    let pump = tokio::spawn(async move {
        while let Some(notification) = note_rx.recv().await {
            if note_out.send(notification).await.is_err() {
                break;
            }
        }
    });

    let client = ClientContext::new(client_id, "stdio", Some(note_tx));

    info!("MCP gateway listening on stdio");

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = line.trim();
                if raw.is_empty() {
                    continue;
                }

                let parsed: Value = match serde_json::from_str(raw) {
                    Ok(v) => v,
                    Err(e) => {
                        let err = GatewayError::Parse(e.to_string());
                        let _ = out_tx.send(protocol::error_response(None, &err)).await;
                        continue;
                    }
                };

                // Requests run concurrently; each produces at most one
                // response through the shared writer.
                let dispatcher = Arc::clone(&dispatcher);
                let client = client.clone();
                let out = out_tx.clone();
                tokio::spawn(async move {
                    if let Some(response) = dispatcher.handle_message(parsed, &client).await {
                        if out.send(response).await.is_err() {
                            debug!("stdout writer gone, dropping response");
                        }
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        }
    }

    dispatcher.bus().drop_client(client_id);
    pump.abort();
    drop(out_tx);
    let _ = writer.await;
    info!("stdio transport closed");
    Ok(())
}
