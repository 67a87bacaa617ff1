use crate::channel::ChannelError;

/// The trimmed-mean reduction of a burst: the value, how many samples
/// survived the trim, and the bounds of the retained window.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    pub value: f64,
    pub retained: usize,
    pub window: (f64, f64),
}

/// Mean of the middle two quartiles. Sorts the burst, discards the lowest
/// floor(n/4) values, keeps through the ceil(3n/4)-th, and averages what is
/// left. Bursts shorter than 4 are rejected outright so the window math can
/// never divide by zero.
pub fn trimmed_mean(values: &[f64]) -> Result<Reading, ChannelError> {
    let n = values.len();
    if n < 4 {
        return Err(ChannelError::InsufficientSamples { got: n });
    }

    let mut ordered = values.to_vec();
    ordered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let lower = n / 4;
    let upper = (3 * n).div_ceil(4);
    let window = &ordered[lower..upper];
    let mean = window.iter().sum::<f64>() / window.len() as f64;

    Ok(Reading {
        value: mean,
        retained: window.len(),
        window: (window[0], window[window.len() - 1]),
    })
}
