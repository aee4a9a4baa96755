//! The narrow device contract the bridge drives, plus the sources that
//! ship with the toolbox.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::recorder::read_forces;
use common::{ManualClock, RecorderError, Transport};
use log::{debug, warn};

use crate::bridge::BeltSettings;
use crate::error::SourceError;

/// Vendor device handle, driven in the order
/// `open -> configure -> start -> read* -> stop -> close`.
///
/// `read` blocks for up to one sampling period and returns one value per
/// enabled channel, or `None` when nothing arrived this cycle.
pub trait SampleSource: Send {
    fn open(&mut self, transport: Transport, device: Option<&str>) -> Result<(), SourceError>;
    fn configure(&mut self, channels: &[u32]) -> Result<(), SourceError>;
    fn start(&mut self, period_ms: u64) -> Result<(), SourceError>;
    fn read(&mut self) -> Result<Option<Vec<f64>>, SourceError>;
    fn stop(&mut self) -> Result<(), SourceError>;
    fn close(&mut self) -> Result<(), SourceError>;
}

/// Opens, configures and starts `source`; the caller cleans up on error.
pub fn open_device(source: &mut dyn SampleSource, settings: &BeltSettings) -> Result<(), SourceError> {
    debug!(
        "Opening belt: transport={}, device={:?}, period={} ms, channels={:?}",
        settings.transport, settings.device, settings.period_ms, settings.channels
    );
    source.open(settings.transport, settings.device.as_deref())?;
    source.configure(&settings.channels)?;
    source.start(settings.period_ms)?;
    Ok(())
}

/// Best-effort `stop` + `close`; failures are logged, never returned.
pub fn release_device(source: &mut dyn SampleSource) {
    if let Err(err) = source.stop() {
        debug!("Device stop failed during cleanup: {err}");
    }
    if let Err(err) = source.close() {
        warn!("Device close failed during cleanup: {err}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Closed,
    Open,
    Configured,
    Streaming,
}

/// Synthetic respiration belt.
///
/// Produces `center + amplitude * sin(2π f t)` plus a small deterministic
/// wobble. Paced in real time, or, when given a [`ManualClock`], by
/// advancing that clock one period per read.
pub struct SimulatedBelt {
    center: f64,
    amplitude: f64,
    breath_hz: f64,
    jitter: f64,
    clock: Option<Arc<ManualClock>>,
    refused: Vec<Transport>,
    gaps_at: Vec<u64>,
    fault_after: Option<u64>,
    max_reads: Option<u64>,
    period: Duration,
    channels: usize,
    reads: u64,
    state: DeviceState,
}

impl Default for SimulatedBelt {
    fn default() -> Self {
        Self {
            center: 5.0,
            amplitude: 2.0,
            breath_hz: 0.25,
            jitter: 0.05,
            clock: None,
            refused: Vec::new(),
            gaps_at: Vec::new(),
            fault_after: None,
            max_reads: None,
            period: Duration::from_millis(100),
            channels: 1,
            reads: 0,
            state: DeviceState::Closed,
        }
    }
}

impl SimulatedBelt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_breathing(mut self, center: f64, amplitude: f64, breath_hz: f64) -> Self {
        self.center = center;
        self.amplitude = amplitude;
        self.breath_hz = breath_hz;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Drive time from `clock` instead of sleeping.
    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Fail `open` on this transport, as a belt out of BLE range would.
    pub fn refusing(mut self, transport: Transport) -> Self {
        self.refused.push(transport);
        self
    }

    /// Return an empty read at these 0-based read indices.
    pub fn with_gaps_at(mut self, reads: impl IntoIterator<Item = u64>) -> Self {
        self.gaps_at.extend(reads);
        self
    }

    /// Raise a fault on the read following `reads` successful ones.
    pub fn faulting_after(mut self, reads: u64) -> Self {
        self.fault_after = Some(reads);
        self
    }

    /// After `reads` reads, only gaps are returned.
    pub fn limited_to(mut self, reads: u64) -> Self {
        self.max_reads = Some(reads);
        self
    }

    fn pace(&self) {
        match &self.clock {
            Some(clock) => {
                clock.advance(self.period);
                // Keep a starved reader from spinning flat out.
                thread::yield_now();
            }
            None => thread::sleep(self.period),
        }
    }

    fn value_at(&self, index: u64) -> f64 {
        let t = index as f64 * self.period.as_secs_f64();
        let wobble = ((index as f64 * 12.9898).sin() * 43_758.545).fract();
        self.center + self.amplitude * (TAU * self.breath_hz * t).sin() + self.jitter * wobble
    }
}

impl SampleSource for SimulatedBelt {
    fn open(&mut self, transport: Transport, _device: Option<&str>) -> Result<(), SourceError> {
        if self.refused.contains(&transport) {
            return Err(SourceError::NotFound(transport));
        }
        self.state = DeviceState::Open;
        Ok(())
    }

    fn configure(&mut self, channels: &[u32]) -> Result<(), SourceError> {
        if self.state != DeviceState::Open {
            return Err(SourceError::State("configure before open".to_string()));
        }
        if channels.is_empty() {
            return Err(SourceError::Configuration("no channels selected".to_string()));
        }
        self.channels = channels.len();
        self.state = DeviceState::Configured;
        Ok(())
    }

    fn start(&mut self, period_ms: u64) -> Result<(), SourceError> {
        if self.state != DeviceState::Configured {
            return Err(SourceError::State("start before configure".to_string()));
        }
        self.period = Duration::from_millis(period_ms);
        self.state = DeviceState::Streaming;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<f64>>, SourceError> {
        if self.state != DeviceState::Streaming {
            return Err(SourceError::State("read while not streaming".to_string()));
        }
        if self.fault_after == Some(self.reads) {
            return Err(SourceError::Fault("simulated transport loss".to_string()));
        }

        self.pace();
        let index = self.reads;
        self.reads += 1;

        if self.max_reads.is_some_and(|max| index >= max) {
            // Exhausted: idle instead of flooding a simulated clock.
            thread::sleep(Duration::from_millis(1));
            return Ok(None);
        }
        if self.gaps_at.contains(&index) {
            return Ok(None);
        }
        let value = self.value_at(index);
        Ok(Some(vec![value; self.channels]))
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        if self.state == DeviceState::Streaming {
            self.state = DeviceState::Configured;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.state = DeviceState::Closed;
        Ok(())
    }
}

/// Replays recorded forces at the configured period. Once exhausted every
/// read is a gap.
#[derive(Clone)]
pub struct ReplaySource {
    forces: VecDeque<f64>,
    period: Duration,
    clock: Option<Arc<ManualClock>>,
    streaming: bool,
}

impl ReplaySource {
    pub fn from_values(forces: impl IntoIterator<Item = f64>) -> Self {
        Self {
            forces: forces.into_iter().collect(),
            period: Duration::from_millis(100),
            clock: None,
            streaming: false,
        }
    }

    /// Loads the `force_n` column of a recorded session.
    pub fn from_session_file(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        Ok(Self::from_values(read_forces(path)?))
    }

    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn remaining(&self) -> usize {
        self.forces.len()
    }
}

impl SampleSource for ReplaySource {
    fn open(&mut self, _transport: Transport, _device: Option<&str>) -> Result<(), SourceError> {
        Ok(())
    }

    fn configure(&mut self, _channels: &[u32]) -> Result<(), SourceError> {
        Ok(())
    }

    fn start(&mut self, period_ms: u64) -> Result<(), SourceError> {
        self.period = Duration::from_millis(period_ms);
        self.streaming = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<f64>>, SourceError> {
        if !self.streaming {
            return Err(SourceError::State("read while not streaming".to_string()));
        }
        match &self.clock {
            Some(clock) => {
                clock.advance(self.period);
                thread::yield_now();
            }
            None => thread::sleep(self.period),
        }
        let next = self.forces.pop_front();
        if next.is_none() && self.clock.is_some() {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(next.map(|force| vec![force]))
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.streaming = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
