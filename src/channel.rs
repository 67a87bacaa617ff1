use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Per-channel failure taxonomy for one cycle. Carried as a value into the
/// record assembly so a bad channel never aborts the cycle.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("read failed after {completed} of {requested} samples: {reason}")]
    Read {
        completed: usize,
        requested: usize,
        reason: String,
    },
    #[error("power control failed: {0}")]
    Power(String),
    #[error("conversion produced {bad} non-finite values in a burst of {requested}")]
    Conversion { bad: usize, requested: usize },
    #[error("insufficient samples: burst of {got} cannot fill the middle-quartile window")]
    InsufficientSamples { got: usize },
}

/// One raw reading from hardware. Implementations must not block longer than
/// a single conversion takes; burst timing lives in the sampler.
pub trait SampleSource: Send {
    fn read_raw(&mut self) -> Result<f64>;
}

/// Excitation power for a channel, held on for the duration of a burst.
pub trait PowerControl: Send {
    fn energize(&mut self) -> Result<()>;
    fn idle(&mut self) -> Result<()>;
}

/// Reads an industrial-io raw attribute (`in_voltage*_raw`). Any file whose
/// content is a single numeric value works, which is also how tests feed
/// scripted counts in.
pub struct IioRawSource {
    path: PathBuf,
}

impl IioRawSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SampleSource for IioRawSource {
    fn read_raw(&mut self) -> Result<f64> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        raw.trim()
            .parse::<f64>()
            .with_context(|| format!("non-numeric sample in {}", self.path.display()))
    }
}

/// Drives a sysfs GPIO value file high while a burst is in flight.
pub struct SysfsGpioSwitch {
    value_path: PathBuf,
}

impl SysfsGpioSwitch {
    pub fn new(value_path: PathBuf) -> Self {
        Self { value_path }
    }

    fn write(&self, level: &str) -> Result<()> {
        fs::write(&self.value_path, level)
            .with_context(|| format!("write {}", self.value_path.display()))
    }
}

impl PowerControl for SysfsGpioSwitch {
    fn energize(&mut self) -> Result<()> {
        self.write("1")
    }

    fn idle(&mut self) -> Result<()> {
        self.write("0")
    }
}

/// Excitation-pulsed source for electrode probes: drives a GPIO high, waits
/// for the cell to settle, reads the ADC, and drives the GPIO low again,
/// once per sample. Listing two drive pins alternates polarity between
/// samples, which keeps ions from plating onto a conductivity cell.
pub struct PulsedSource {
    adc: IioRawSource,
    drives: Vec<SysfsGpioSwitch>,
    pulse: Duration,
    next_drive: usize,
}

impl PulsedSource {
    pub fn new(adc: IioRawSource, drives: Vec<SysfsGpioSwitch>, pulse: Duration) -> Self {
        Self {
            adc,
            drives,
            pulse,
            next_drive: 0,
        }
    }
}

impl SampleSource for PulsedSource {
    fn read_raw(&mut self) -> Result<f64> {
        let index = self.next_drive;
        self.next_drive = (self.next_drive + 1) % self.drives.len();
        let drive = &mut self.drives[index];

        drive.energize()?;
        if !self.pulse.is_zero() {
            std::thread::sleep(self.pulse);
        }
        let value = self.adc.read_raw();
        // the pin must come back down even when the read failed
        let idled = drive.idle();
        let value = value?;
        idled?;
        Ok(value)
    }
}

/// Best-effort user-feedback LED (a sysfs brightness file). Failures are
/// ignored; an unwired LED must never cost a cycle.
pub struct StatusIndicator {
    path: PathBuf,
}

impl StatusIndicator {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn set(&self, on: bool) {
        let _ = fs::write(&self.path, if on { "1" } else { "0" });
    }
}

fn default_divider() -> f64 {
    1.0
}

/// Raw-to-physical conversion applied per sample, before aggregation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Conversion {
    /// Raw counts logged as-is.
    Raw,
    Linear {
        scale: f64,
        offset: f64,
    },
    /// ADC count to volts. `divider` multiplies the result back up for
    /// supplies read through a resistor divider (2.0 for the usual 100k/100k
    /// battery tap).
    Voltage {
        max_count: f64,
        max_voltage: f64,
        #[serde(default = "default_divider")]
        divider: f64,
    },
    /// NTC thermistor behind a series resistor, Steinhart-Hart coefficients.
    Thermistor {
        max_count: f64,
        max_voltage: f64,
        supply_voltage: f64,
        series_resistance: f64,
        a: f64,
        b: f64,
        c: f64,
    },
}

impl Default for Conversion {
    fn default() -> Self {
        Self::Raw
    }
}

impl Conversion {
    pub fn apply(&self, raw: f64) -> f64 {
        match self {
            Conversion::Raw => raw,
            Conversion::Linear { scale, offset } => raw * scale + offset,
            Conversion::Voltage {
                max_count,
                max_voltage,
                divider,
            } => raw / max_count * max_voltage * divider,
            Conversion::Thermistor {
                max_count,
                max_voltage,
                supply_voltage,
                series_resistance,
                a,
                b,
                c,
            } => {
                let volts = raw / max_count * max_voltage;
                if volts <= 0.0 || volts >= *supply_voltage {
                    return f64::NAN;
                }
                let current = volts / series_resistance;
                let resistance = (supply_voltage - volts) / current;
                let ln_r = resistance.ln();
                1.0 / (a + b * ln_r + c * ln_r.powi(3)) - 273.15
            }
        }
    }
}

/// One channel as declared in the JSON channels file.
///
/// ```json
/// {
///   "name": "battery_v",
///   "source": "/sys/bus/iio/devices/iio:device0/in_voltage3_raw",
///   "burst_len": 12,
///   "inter_read_delay_ms": 200,
///   "power_gpio": "/sys/class/gpio/gpio13/value",
///   "conversion": { "kind": "voltage", "max_count": 4095, "max_voltage": 3.6, "divider": 2.0 }
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelSpec {
    pub name: String,
    pub source: PathBuf,
    #[serde(default = "default_burst_len")]
    pub burst_len: usize,
    #[serde(default = "default_inter_read_delay_ms")]
    pub inter_read_delay_ms: u64,
    #[serde(default)]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub power_gpio: Option<PathBuf>,
    /// Drive pins pulsed per sample; two entries alternate polarity.
    #[serde(default)]
    pub drive_gpios: Vec<PathBuf>,
    #[serde(default)]
    pub pulse_ms: u64,
    #[serde(default)]
    pub conversion: Conversion,
}

fn default_burst_len() -> usize {
    12
}

fn default_inter_read_delay_ms() -> u64 {
    200
}

impl ChannelSpec {
    pub fn build(&self) -> Channel {
        let adc = IioRawSource::new(self.source.clone());
        let source: Box<dyn SampleSource> = if self.drive_gpios.is_empty() {
            Box::new(adc)
        } else {
            let drives = self
                .drive_gpios
                .iter()
                .cloned()
                .map(SysfsGpioSwitch::new)
                .collect();
            Box::new(PulsedSource::new(
                adc,
                drives,
                Duration::from_millis(self.pulse_ms),
            ))
        };
        Channel {
            name: self.name.clone(),
            source,
            power: self
                .power_gpio
                .clone()
                .map(|path| Box::new(SysfsGpioSwitch::new(path)) as Box<dyn PowerControl>),
            burst_len: self.burst_len,
            inter_read_delay: Duration::from_millis(self.inter_read_delay_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            conversion: self.conversion.clone(),
        }
    }
}

/// Runtime form of a channel: owned handles, no module-level singletons, so
/// any number of channels can be sampled or tested independently.
pub struct Channel {
    pub name: String,
    pub source: Box<dyn SampleSource>,
    pub power: Option<Box<dyn PowerControl>>,
    pub burst_len: usize,
    pub inter_read_delay: Duration,
    pub settle_delay: Duration,
    pub conversion: Conversion,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn voltage_conversion_scales_divider_back_up() {
        let conversion = Conversion::Voltage {
            max_count: 4095.0,
            max_voltage: 3.6,
            divider: 2.0,
        };
        let volts = conversion.apply(2048.0);
        assert!((volts - 2048.0 / 4095.0 * 3.6 * 2.0).abs() < 1e-9);
    }

    #[test]
    fn thermistor_conversion_hits_nominal_point() {
        // 10k NTC with 10k series resistor reads half the supply at 25 C.
        let conversion = Conversion::Thermistor {
            max_count: 8191.0,
            max_voltage: 2.730,
            supply_voltage: 3.3,
            series_resistance: 10_000.0,
            a: 0.001125308852122,
            b: 0.000234711863267,
            c: 0.000000085663516,
        };
        let raw = 1.65 / 2.730 * 8191.0;
        let celsius = conversion.apply(raw);
        assert!((celsius - 25.0).abs() < 0.05, "got {celsius}");
    }

    #[test]
    fn thermistor_conversion_flags_railed_counts() {
        let conversion = Conversion::Thermistor {
            max_count: 8191.0,
            max_voltage: 2.730,
            supply_voltage: 3.3,
            series_resistance: 10_000.0,
            a: 0.001125308852122,
            b: 0.000234711863267,
            c: 0.000000085663516,
        };
        assert!(conversion.apply(0.0).is_nan());
    }

    #[test]
    fn iio_source_parses_single_value_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  3121").unwrap();
        let mut source = IioRawSource::new(file.path().to_path_buf());
        assert_eq!(source.read_raw().unwrap(), 3121.0);
    }

    #[test]
    fn iio_source_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not-a-count").unwrap();
        let mut source = IioRawSource::new(file.path().to_path_buf());
        assert!(source.read_raw().is_err());
    }

    #[test]
    fn pulsed_source_alternates_drive_pins_and_idles_them() {
        let mut adc = tempfile::NamedTempFile::new().unwrap();
        writeln!(adc, "2040").unwrap();
        let drive_a = tempfile::NamedTempFile::new().unwrap();
        let drive_b = tempfile::NamedTempFile::new().unwrap();

        let mut source = PulsedSource::new(
            IioRawSource::new(adc.path().to_path_buf()),
            vec![
                SysfsGpioSwitch::new(drive_a.path().to_path_buf()),
                SysfsGpioSwitch::new(drive_b.path().to_path_buf()),
            ],
            Duration::ZERO,
        );

        assert_eq!(source.read_raw().unwrap(), 2040.0);
        assert_eq!(fs::read_to_string(drive_a.path()).unwrap(), "0");
        assert!(fs::read_to_string(drive_b.path()).unwrap().is_empty());

        assert_eq!(source.read_raw().unwrap(), 2040.0);
        assert_eq!(fs::read_to_string(drive_b.path()).unwrap(), "0");
    }

    #[test]
    fn pulsed_source_drops_the_pin_when_the_read_fails() {
        let drive = tempfile::NamedTempFile::new().unwrap();
        let mut source = PulsedSource::new(
            IioRawSource::new(PathBuf::from("/nonexistent/adc_raw")),
            vec![SysfsGpioSwitch::new(drive.path().to_path_buf())],
            Duration::ZERO,
        );
        assert!(source.read_raw().is_err());
        assert_eq!(fs::read_to_string(drive.path()).unwrap(), "0");
    }

    #[test]
    fn channel_spec_builds_pulsed_source_when_drives_listed() {
        let spec: ChannelSpec = serde_json::from_str(
            r#"{
                "name": "ec",
                "source": "/tmp/raw",
                "drive_gpios": ["/tmp/gpio5", "/tmp/gpio6"],
                "pulse_ms": 1
            }"#,
        )
        .unwrap();
        assert_eq!(spec.drive_gpios.len(), 2);
        assert_eq!(spec.pulse_ms, 1);
        let channel = spec.build();
        assert_eq!(channel.name, "ec");
    }

    #[test]
    fn channel_spec_defaults_apply() {
        let spec: ChannelSpec = serde_json::from_str(
            r#"{ "name": "ec", "source": "/tmp/raw" }"#,
        )
        .unwrap();
        assert_eq!(spec.burst_len, 12);
        assert_eq!(spec.inter_read_delay_ms, 200);
        assert!(spec.power_gpio.is_none());
        assert!(matches!(spec.conversion, Conversion::Raw));
    }
}
