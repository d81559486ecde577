//! Stub peer speaking newline-delimited JSON on stdio.
//!
//! Methods:
//! - `initialize` - returns server info
//! - `echo` - returns its params, after `delayMs` if given
//! - `notify` - sends `count` `tick` notifications, then returns `{sent}`
//! - `silence` - never answers
//!
//! The `exit` notification terminates the process immediately. Logs go to
//! stderr.

use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    sync::Mutex,
};
use toolwire_core::{Frame, Request, RpcError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Output = Arc<Mutex<Stdout>>;

async fn write_frame(out: &Output, frame: &Frame) -> std::io::Result<()> {
    let encoded = frame
        .encode()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut out = out.lock().await;
    out.write_all(&encoded).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

async fn handle_request(out: Output, request: Request) {
    let params = request.params.clone().unwrap_or(Value::Null);
    let reply = match request.method.as_str() {
        "initialize" => Frame::result(
            request.id,
            json!({ "serverInfo": { "name": "echo-peer" }, "capabilities": {} }),
        ),
        "echo" => {
            if let Some(delay) = params.get("delayMs").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Frame::result(request.id, params)
        }
        "notify" => {
            let count = params.get("count").and_then(Value::as_u64).unwrap_or(0);
            for seq in 0..count {
                let tick = Frame::notification("tick", Some(json!({ "seq": seq })));
                if let Err(e) = write_frame(&out, &tick).await {
                    tracing::error!(error = %e, "failed to write notification");
                    return;
                }
            }
            Frame::result(request.id, json!({ "sent": count }))
        }
        "silence" => return,
        other => Frame::error(request.id, RpcError::method_not_found(other)),
    };
    if let Err(e) = write_frame(&out, &reply).await {
        tracing::error!(error = %e, "failed to write response");
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let out: Output = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match Frame::decode_str(&line) {
            // Each request runs on its own task so slow echoes answer out of order.
            Ok(Frame::Request(request)) => {
                tokio::spawn(handle_request(Arc::clone(&out), request));
            }
            Ok(Frame::Notification(notification)) if notification.method == "exit" => {
                tracing::info!("exit requested");
                std::process::exit(0);
            }
            Ok(Frame::Notification(notification)) => {
                tracing::debug!(method = %notification.method, "notification ignored");
            }
            Ok(Frame::Response(response)) => {
                tracing::debug!(request_id = %response.id, "response ignored");
            }
            Err(e) => tracing::warn!(error = %e, "malformed frame"),
        }
    }
    tracing::info!("stdin closed");
    Ok(())
}
