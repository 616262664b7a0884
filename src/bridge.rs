//! Newline-delimited JSON bridge between the supervising process and the router.
//!
//! Requests arrive one per line on the input. Each is handled on its own task
//! so a `ping` is answered while a model is still loading. Responses, status
//! events and heartbeats all go to the output as single JSON lines, behind one
//! writer lock so lines never interleave.
//!
//! The output is reserved for the protocol; diagnostics belong on stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::events::{Event, EventBus};
use crate::heartbeat::HeartbeatHandle;
use crate::router::{Response, Router};

const REQUEST_ID_FIELD: &str = "requestId";

type SharedWriter<W> = Arc<Mutex<W>>;

pub struct BridgeConfig {
    pub heartbeat_period: Duration,
}

/// Serve requests from `input` until EOF, then stop the heartbeat, let any
/// preload settle and unload.
pub async fn serve<R, W>(
    router: Arc<Router>,
    bus: Arc<EventBus>,
    config: BridgeConfig,
    input: R,
    output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(output));

    let (stop_events, events_stopped) = watch::channel(false);
    let forwarder = tokio::spawn(forward_events(
        bus.subscribe(),
        events_stopped,
        Arc::clone(&writer),
    ));

    let heartbeat = HeartbeatHandle::start(
        router.manager().clone(),
        Arc::clone(&bus),
        config.heartbeat_period,
    );
    let preload = router.manager().auto_preload();

    let mut requests = JoinSet::new();
    let mut lines = input.lines();
    let read_result: Result<()> = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("input closed; shutting down bridge");
                break Ok(());
            }
            Err(e) => break Err(anyhow::Error::from(e).context("failed to read request line")),
        };
        if line.trim().is_empty() {
            continue;
        }

        let router = Arc::clone(&router);
        let writer = Arc::clone(&writer);
        requests.spawn(async move {
            if let Some(reply) = dispatch(&router, line.trim()).await {
                if let Err(e) = write_json(&writer, &reply).await {
                    warn!(error = %e, "failed to write response");
                }
            }
        });
        while requests.try_join_next().is_some() {}
    };

    while requests.join_next().await.is_some() {}

    heartbeat.stop().await;
    if let Some(preload) = preload {
        finish_preload(preload).await;
    }
    router.manager().unload().await;

    let _ = stop_events.send(true);
    let _ = forwarder.await;

    read_result
}

/// Handle one raw line. Returns the reply line, or `None` when the message
/// was addressed to someone else.
pub async fn dispatch(router: &Router, line: &str) -> Option<Value> {
    let message: Value = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, raw_line = %line, "failed to parse request line");
            return Some(json!({
                "success": false,
                "error": format!("invalid JSON: {e}"),
            }));
        }
    };

    let request_id = message.get(REQUEST_ID_FIELD).cloned();
    let response = router.route(&message).await?;
    Some(with_request_id(response, request_id))
}

fn with_request_id(response: Response, request_id: Option<Value>) -> Value {
    let mut reply = match serde_json::to_value(&response) {
        Ok(reply) => reply,
        Err(e) => json!({
            "success": false,
            "error": format!("failed to encode response: {e}"),
        }),
    };
    if let (Some(id), Some(object)) = (request_id, reply.as_object_mut()) {
        object.insert(REQUEST_ID_FIELD.to_string(), id);
    }
    reply
}

/// A load cannot be cancelled once the runtime has it, so shutdown waits for
/// the preload to settle before unloading whatever it produced.
async fn finish_preload(preload: JoinHandle<Result<(), EngineError>>) {
    if !preload.is_finished() {
        debug!("waiting for preload before shutdown");
    }
    match preload.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "preload failed before shutdown"),
        Err(e) => warn!(error = %e, "preload task ended abnormally"),
    }
}

async fn forward_events<W>(
    mut events: broadcast::Receiver<Event>,
    mut stopped: watch::Receiver<bool>,
    writer: SharedWriter<W>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if let Err(e) = write_json(&writer, &event).await {
                        warn!(error = %e, "failed to write event; stopping event forwarder");
                        return;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(RecvError::Closed) => return,
            },
            _ = stopped.changed() => break,
        }
    }

    // Flush what was already queued before the stop.
    loop {
        match events.try_recv() {
            Ok(event) => {
                if write_json(&writer, &event).await.is_err() {
                    return;
                }
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return,
        }
    }
}

async fn write_json<W, T>(writer: &SharedWriter<W>, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_string(value).context("failed to serialize output line")?;
    line.push('\n');

    let mut w = writer.lock().await;
    w.write_all(line.as_bytes())
        .await
        .context("failed to write output line")?;
    w.flush().await.context("failed to flush output")?;
    Ok(())
}
