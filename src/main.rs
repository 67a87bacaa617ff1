mod aggregate;
mod channel;
mod config;
mod push;
mod record;
mod sampler;
mod scheduler;
mod sink;

use crate::channel::{Channel, StatusIndicator};
use crate::config::Config;
use crate::scheduler::{Scheduler, SystemClock};
use crate::sink::CsvSink;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,node_sampler=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let run_id = Uuid::new_v4();
    tracing::info!(
        node_id = %config.node_id,
        run_id = %run_id,
        interval_secs = config.interval.as_secs(),
        "node-sampler starting"
    );

    let specs = config::load_channel_specs(&config.channels_path)?;
    anyhow::ensure!(
        !specs.is_empty(),
        "no channels configured in {}",
        config.channels_path.display()
    );
    let field_names: Vec<String> = specs.iter().map(|spec| spec.name.clone()).collect();
    let channels: Vec<Channel> = specs.iter().map(|spec| spec.build()).collect();
    tracing::info!(channels = channels.len(), sink = %config.sink_path.display(), "channels configured");

    let cancel = CancellationToken::new();

    let (push_tx, push_handle) = match config.push_url.clone() {
        Some(url) => {
            let (tx, handle) = push::spawn_push_task(
                url,
                config.push_token.clone(),
                config.node_id.clone(),
                run_id,
                config.push_queue,
            );
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    let sink = CsvSink::new(config.sink_path.clone(), &field_names);
    let indicator = config.led_path.clone().map(StatusIndicator::new);
    let scheduler = Scheduler::new(
        channels,
        Box::new(sink),
        Arc::new(SystemClock),
        config.interval,
        config.wait_slice,
        indicator,
        push_tx,
        cancel.clone(),
    )?;
    let sampler_handle = scheduler::spawn_scheduler_thread(scheduler)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();

    // The cycle thread owns the push sender; once it exits, the push task
    // drains its queue and finishes.
    tokio::task::spawn_blocking(move || sampler_handle.join())
        .await?
        .map_err(|_| anyhow::anyhow!("sample cycle thread panicked"))?;
    if let Some(handle) = push_handle {
        let _ = handle.await;
    }

    Ok(())
}
