use anyhow::{Context, Result, anyhow};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use pushbuild_core::models::{RunLog, TimeStamp};
use pushbuild_github::webhook::{EVENT_HEADER, SIGNATURE_HEADER, parse_push, verify};
use pushbuild_jobs::RunHandle;

use crate::{AppState, escalation::Lifecycle};

/// Webhook handler for push notifications.
///
/// The sender always gets a response right away; whatever happens afterwards
/// is only visible through the run log, incident reports and process exit.
pub async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if state.escalation.lifecycle() != Lifecycle::Serving {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }
    let log = RunLog::new();
    let timestamp = TimeStamp::now();
    if let Err(e) = handle_event(&state, &headers, &body, &log, timestamp).await {
        tokio::spawn(async move { state.escalation.escalate(&log, timestamp, e).await });
    }
    (StatusCode::OK, "OK").into_response()
}

/// Authenticate, filter and dispatch one event.
///
/// Errors returned from here are unexpected for an authenticated sender and
/// must be escalated by the caller.
async fn handle_event(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    log: &RunLog,
    timestamp: TimeStamp,
) -> Result<()> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !verify(state.config.webhook.secret.as_bytes(), body, signature) {
        // Untrusted request: recorded, but neither flushed nor escalated.
        log.error(format!("Signature mismatch for event {timestamp}, headers: {headers:?}"));
        return Ok(());
    }

    if let Some(kind) = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok())
        && kind != "push"
    {
        log.info(format!("Ignoring {kind} event"));
        return state.store.flush(timestamp, log).await.context("Failed to flush run log");
    }

    let event = parse_push(body).context("Failed to parse push notification")?;
    let target_ref = state.config.webhook.target_ref();
    if event.git_ref != target_ref {
        log.info(format!("Ignoring push to {}", event.git_ref));
        return state.store.flush(timestamp, log).await.context("Failed to flush run log");
    }

    log.info(format!("Push to {} accepted as event {}", event.git_ref, timestamp));
    match state.scheduler.trigger(log, timestamp) {
        Some(handle) => {
            tokio::spawn(supervise(state.clone(), handle, log.clone(), timestamp));
        }
        None => {
            // Coalesced into the running job, which flushes its own log
            state.store.flush(timestamp, log).await.context("Failed to flush run log")?;
        }
    }
    Ok(())
}

/// Wait for a started job (and its reruns), then flush its log or escalate.
async fn supervise(state: AppState, handle: RunHandle, log: RunLog, timestamp: TimeStamp) {
    let result = match handle.await {
        Ok(Ok(())) => state.store.flush(timestamp, &log).await.context("Failed to flush run log"),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(anyhow!(e).context("Job task aborted")),
    };
    if let Err(e) = result {
        state.escalation.escalate(&log, timestamp, e).await;
    }
}
