use crate::record::LogRecord;
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const PUSH_ATTEMPTS: usize = 4;
const PUSH_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Spawns the remote push task and hands back the sender the cycle loop
/// feeds. Records that cannot be delivered within the fixed attempt count
/// are dropped for that cycle; the next cycle gets a fresh start.
pub fn spawn_push_task(
    url: String,
    token: Option<String>,
    node_id: String,
    run_id: Uuid,
    queue: usize,
) -> (mpsc::Sender<LogRecord>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue.max(1));
    let handle = tokio::spawn(async move {
        run_push_task(rx, url, token, node_id, run_id).await;
    });
    (tx, handle)
}

async fn run_push_task(
    mut rx: mpsc::Receiver<LogRecord>,
    url: String,
    token: Option<String>,
    node_id: String,
    run_id: Uuid,
) {
    let client = Client::new();
    while let Some(record) = rx.recv().await {
        let payload = flat_payload(&record, &node_id, run_id);
        if let Err(err) = post_with_retry(
            &client,
            &url,
            token.as_deref(),
            &payload,
            PUSH_ATTEMPTS,
            PUSH_RETRY_PAUSE,
        )
        .await
        {
            tracing::warn!(error = %err, "push failed; dropping record for this cycle");
        }
    }
}

/// Flat key/value payload: node identity plus one numeric entry per field,
/// with failed fields carrying the same sentinel the sink writes.
fn flat_payload(record: &LogRecord, node_id: &str, run_id: Uuid) -> Value {
    let mut payload = Map::new();
    payload.insert("node_id".to_string(), json!(node_id));
    payload.insert("run_id".to_string(), json!(run_id));
    payload.insert("timestamp".to_string(), json!(record.timestamp.to_rfc3339()));
    for (name, field) in &record.fields {
        payload.insert(name.clone(), json!(field.numeric()));
    }
    Value::Object(payload)
}

async fn post_with_retry(
    client: &Client,
    url: &str,
    token: Option<&str>,
    payload: &Value,
    attempts: usize,
    pause: Duration,
) -> Result<()> {
    let mut last_error = anyhow!("no attempts made");
    for attempt in 1..=attempts {
        let mut request = client.post(url).json(payload);
        if let Some(token) = token {
            request = request.header("X-Ingest-Token", token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => last_error = anyhow!("endpoint returned {}", response.status()),
            Err(err) => last_error = err.into(),
        }
        if attempt < attempts {
            tokio::time::sleep(pause).await;
        }
    }
    Err(last_error.context(format!("gave up after {attempts} attempts")))
}
