use crate::aggregate::{trimmed_mean, Reading};
use crate::channel::{Channel, ChannelError, StatusIndicator};
use crate::record::{FieldValue, LogRecord};
use crate::sampler::sample_burst;
use crate::sink::RecordSink;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Wall-clock access for the cycle loop. Production uses the system clock;
/// tests inject a scripted one.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// The sample-log-sleep loop. Two states: WAITING (sliced, cancellable idle
/// until the stored fire time) and SAMPLING (burst every channel in declared
/// order, append one record, hand it to the push task). The fire time then
/// advances by exactly one interval, never from "now", so slow cycles do not
/// accumulate drift.
pub struct Scheduler {
    channels: Vec<Channel>,
    sink: Box<dyn RecordSink>,
    clock: Arc<dyn Clock>,
    interval: ChronoDuration,
    wait_slice: Duration,
    indicator: Option<StatusIndicator>,
    push_tx: Option<mpsc::Sender<LogRecord>>,
    cancel: CancellationToken,
    next_fire: DateTime<Utc>,
    cycles: u64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: Vec<Channel>,
        sink: Box<dyn RecordSink>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        wait_slice: Duration,
        indicator: Option<StatusIndicator>,
        push_tx: Option<mpsc::Sender<LogRecord>>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let interval = ChronoDuration::from_std(interval).context("interval out of range")?;
        let next_fire = clock.now() + interval;
        Ok(Self {
            channels,
            sink,
            clock,
            interval,
            wait_slice,
            indicator,
            push_tx,
            cancel,
            next_fire,
            cycles: 0,
        })
    }

    pub fn next_fire(&self) -> DateTime<Utc> {
        self.next_fire
    }

    pub fn run(mut self) {
        tracing::info!(next_fire = %self.next_fire, "sample cycle loop started");
        while !self.cancel.is_cancelled() {
            self.step();
        }
        if let Some(indicator) = &self.indicator {
            indicator.set(false);
        }
        tracing::info!(cycles = self.cycles, "sample cycle loop stopped");
    }

    fn step(&mut self) {
        self.wait_for_fire_time();
        if self.cancel.is_cancelled() {
            return;
        }
        self.run_cycle();
        self.next_fire = self.next_fire + self.interval;
    }

    /// WAITING: sleep in short slices so cancellation is honored promptly
    /// and the indicator can blink while idle.
    fn wait_for_fire_time(&self) {
        let mut lit = false;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let now = self.clock.now();
            if now >= self.next_fire {
                return;
            }
            let remaining = (self.next_fire - now).to_std().unwrap_or(Duration::ZERO);
            self.clock.sleep(remaining.min(self.wait_slice));
            lit = !lit;
            if let Some(indicator) = &self.indicator {
                indicator.set(lit);
            }
        }
    }

    /// SAMPLING: one full cycle. Channel failures become sentinel fields and
    /// a sink failure is only a warning; nothing here stops the loop.
    fn run_cycle(&mut self) {
        if let Some(indicator) = &self.indicator {
            indicator.set(true);
        }

        let timestamp = self.clock.now();
        let mut fields = Vec::with_capacity(self.channels.len());
        for channel in &mut self.channels {
            let field = match read_channel(channel) {
                Ok(reading) => FieldValue::Reading(reading),
                Err(err) => {
                    tracing::warn!(channel = %channel.name, error = %err, "channel failed; logging sentinel");
                    FieldValue::Failed(err)
                }
            };
            fields.push((channel.name.clone(), field));
        }

        let record = LogRecord { timestamp, fields };
        if let Err(err) = self.sink.append(&record) {
            tracing::warn!(error = %err, "sink append failed; advancing anyway");
        }
        if let Some(tx) = &self.push_tx {
            if tx.try_send(record).is_err() {
                tracing::warn!("push queue full or closed; dropping record");
            }
        }

        self.cycles += 1;
        if let Some(indicator) = &self.indicator {
            indicator.set(false);
        }
    }
}

fn read_channel(channel: &mut Channel) -> Result<Reading, ChannelError> {
    let burst = sample_burst(channel)?;
    let requested = burst.len();
    let converted: Vec<f64> = burst
        .values()
        .map(|raw| channel.conversion.apply(raw))
        .collect();
    let bad = converted.iter().filter(|value| !value.is_finite()).count();
    if bad > 0 {
        return Err(ChannelError::Conversion { bad, requested });
    }
    let reading = trimmed_mean(&converted)?;
    let span = burst
        .samples()
        .last()
        .map(|sample| sample.offset)
        .unwrap_or_default();
    tracing::debug!(
        channel = %channel.name,
        value = reading.value,
        retained = reading.retained,
        window_low = reading.window.0,
        window_high = reading.window.1,
        span_ms = span.as_millis() as u64,
        "channel read"
    );
    Ok(reading)
}

pub fn spawn_scheduler_thread(scheduler: Scheduler) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("sample-cycle".to_string())
        .spawn(move || scheduler.run())
        .context("failed to spawn sample cycle thread")
}
