use crate::channel::{Channel, ChannelError, PowerControl};
use std::time::{Duration, Instant};

/// One raw reading, tagged with its monotonic offset from burst start.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub value: f64,
    pub offset: Duration,
}

/// An ordered batch of samples for one channel from one sampling pass.
#[derive(Debug, Clone)]
pub struct Burst {
    samples: Vec<Sample>,
}

impl Burst {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|sample| sample.value)
    }
}

/// Returns channel power to idle on every exit path, including a failed read
/// partway through a burst.
struct PowerGuard<'a> {
    power: &'a mut dyn PowerControl,
}

impl<'a> PowerGuard<'a> {
    fn energize(power: &'a mut dyn PowerControl) -> Result<Self, ChannelError> {
        power
            .energize()
            .map_err(|err| ChannelError::Power(err.to_string()))?;
        Ok(Self { power })
    }
}

impl Drop for PowerGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.power.idle() {
            tracing::warn!(error = %err, "failed to return channel power to idle");
        }
    }
}

/// Collects exactly `burst_len` reads with a fixed inter-read delay so
/// systematic bias (settling, drift) is comparable across calls. A single
/// failed read aborts the whole burst; no default value is ever substituted.
///
/// The burst is intentionally blocking. Timing is part of the measurement,
/// so nothing here yields to the scheduler.
pub fn sample_burst(channel: &mut Channel) -> Result<Burst, ChannelError> {
    let requested = channel.burst_len;
    let inter_read_delay = channel.inter_read_delay;
    let settle_delay = channel.settle_delay;

    let _guard = match channel.power.as_deref_mut() {
        Some(power) => Some(PowerGuard::energize(power)?),
        None => None,
    };
    if !settle_delay.is_zero() {
        std::thread::sleep(settle_delay);
    }

    let started = Instant::now();
    let mut samples = Vec::with_capacity(requested);
    for index in 0..requested {
        if index > 0 && !inter_read_delay.is_zero() {
            std::thread::sleep(inter_read_delay);
        }
        match channel.source.read_raw() {
            Ok(value) => samples.push(Sample {
                value,
                offset: started.elapsed(),
            }),
            Err(err) => {
                return Err(ChannelError::Read {
                    completed: index,
                    requested,
                    reason: err.to_string(),
                })
            }
        }
    }

    Ok(Burst { samples })
}
