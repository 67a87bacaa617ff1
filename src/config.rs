use crate::channel::ChannelSpec;
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub interval: Duration,
    pub wait_slice: Duration,
    pub sink_path: PathBuf,
    pub channels_path: PathBuf,
    pub push_url: Option<String>,
    pub push_token: Option<String>,
    pub push_queue: usize,
    pub led_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let node_id = env_string("SAMPLER_NODE_ID", Some("field-node".to_string()))?;

        let interval = Duration::from_secs(env_u64("SAMPLER_INTERVAL_SECONDS", Some(300))?);
        anyhow::ensure!(
            !interval.is_zero(),
            "SAMPLER_INTERVAL_SECONDS must be nonzero"
        );
        let wait_slice = Duration::from_millis(env_u64("SAMPLER_WAIT_SLICE_MS", Some(1000))?);
        anyhow::ensure!(!wait_slice.is_zero(), "SAMPLER_WAIT_SLICE_MS must be nonzero");

        let sink_path = PathBuf::from(env_string(
            "SAMPLER_LOG_PATH",
            Some("/opt/node-sampler/storage/samplelog.csv".to_string()),
        )?);
        let channels_path = PathBuf::from(env_string(
            "SAMPLER_CHANNELS_PATH",
            Some("/opt/node-sampler/channels.json".to_string()),
        )?);

        let push_url = match env_optional("SAMPLER_PUSH_URL") {
            Some(raw) => {
                Url::parse(&raw).context("invalid SAMPLER_PUSH_URL")?;
                Some(raw)
            }
            None => None,
        };
        let push_token = env_optional("SAMPLER_PUSH_TOKEN");
        let push_queue = env_u64("SAMPLER_PUSH_QUEUE", Some(64))? as usize;
        let led_path = env_optional("SAMPLER_LED_PATH").map(PathBuf::from);

        Ok(Self {
            node_id,
            interval,
            wait_slice,
            sink_path,
            channels_path,
            push_url,
            push_token,
            push_queue,
            led_path,
        })
    }
}

/// Loads the channel descriptors. Declared order is load-bearing: it fixes
/// the column order of the sink and the sampling order within a cycle.
pub fn load_channel_specs(path: &Path) -> Result<Vec<ChannelSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read channel config {}", path.display()))?;
    let specs: Vec<ChannelSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse channel config {}", path.display()))?;

    let mut seen = HashSet::new();
    for spec in &specs {
        if !seen.insert(spec.name.as_str()) {
            return Err(anyhow!(
                "duplicate channel name {:?} in {}",
                spec.name,
                path.display()
            ));
        }
    }

    Ok(specs)
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn channel_specs_load_in_declared_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{ "name": "ec", "source": "/tmp/ec_raw" }},
                {{ "name": "battery_v", "source": "/tmp/batt_raw",
                   "conversion": {{ "kind": "voltage", "max_count": 4095, "max_voltage": 3.6, "divider": 2.0 }} }}
            ]"#
        )
        .unwrap();
        let specs = load_channel_specs(file.path()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "ec");
        assert_eq!(specs[1].name, "battery_v");
    }

    #[test]
    fn duplicate_channel_names_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{ "name": "ec", "source": "/tmp/a" }},
                {{ "name": "ec", "source": "/tmp/b" }}
            ]"#
        )
        .unwrap();
        assert!(load_channel_specs(file.path()).is_err());
    }
}
