//! Simulated controller for tests and demo mode
//!
//! Implements [`CommunicationChannel`] without hardware: commands written to
//! the channel are answered the way the firmware answers them, with enough
//! state behind the responses to exercise the full reconciler loop: the
//! stepper advances toward its target across polls (answering with the short
//! busy record while moving), relays and PWM latch their commanded values,
//! and the settings records accept patches.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::record;
use crate::protocol::CommunicationChannel;

/// Steps the simulated stepper covers per telemetry poll
const STEPS_PER_POLL: i64 = 400;

/// A simulated AstroLink 4 mini on the other end of the channel
pub struct SimulatedAstroLink {
    rng: StdRng,
    jitter: bool,

    position: i64,
    target: i64,
    relays: [bool; 3],
    pwm: [u8; 2],
    dc_polls_left: u32,
    compensation_delta: i64,

    settings_main: Vec<String>,
    settings_other: Vec<String>,

    pending_input: Vec<u8>,
    response_queue: VecDeque<u8>,
    command_log: Vec<String>,
    swallow: usize,
    swallow_matching: Option<(String, usize)>,
}

impl SimulatedAstroLink {
    /// A simulator with live sensor jitter
    pub fn new() -> Self {
        Self::build(StdRng::from_entropy(), true)
    }

    /// A deterministic simulator with frozen sensor values
    ///
    /// Repeated telemetry polls answer identically while no command changes
    /// the device, which is what diff-suppression tests need.
    pub fn quiescent() -> Self {
        Self::build(StdRng::seed_from_u64(0), false)
    }

    fn build(rng: StdRng, jitter: bool) -> Self {
        Self {
            rng,
            jitter,
            position: 1234,
            target: 1234,
            relays: [false, false, true],
            pwm: [45, 0],
            dc_polls_left: 0,
            compensation_delta: 34,
            settings_main: [
                "10000", "250", "1", "0", "0", "0", "0", "0", "125", "0", "0", "0", "0", "0",
                "1", "0", "0",
            ]
            .map(String::from)
            .to_vec(),
            settings_other: ["1", "0", "50", "0", "0", "0", "0", "0"]
                .map(String::from)
                .to_vec(),
            pending_input: Vec::new(),
            response_queue: VecDeque::new(),
            command_log: Vec::new(),
            swallow: 0,
            swallow_matching: None,
        }
    }

    /// Every command line received so far, terminators stripped
    pub fn command_log(&self) -> &[String] {
        &self.command_log
    }

    /// Number of received commands matching a tag prefix
    pub fn commands_with_prefix(&self, prefix: &str) -> usize {
        self.command_log
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Swallow the next `count` commands without answering or applying them,
    /// as if line noise ate the frames
    pub fn swallow_next(&mut self, count: usize) {
        self.swallow += count;
    }

    /// Swallow the next `count` commands starting with `prefix`; other
    /// commands keep working normally
    pub fn swallow_next_matching(&mut self, prefix: &str, count: usize) {
        self.swallow_matching = Some((prefix.to_string(), count));
    }

    /// Current main settings record fields (test inspection)
    pub fn settings_main(&self) -> &[String] {
        &self.settings_main
    }

    /// Replace the main settings record fields (test setup)
    pub fn set_settings_main(&mut self, fields: Vec<String>) {
        self.settings_main = fields;
    }

    /// Simulated stepper position (test inspection)
    pub fn position(&self) -> i64 {
        self.position
    }

    fn respond(&mut self, line: String) {
        self.response_queue.extend(line.as_bytes());
        self.response_queue.push_back(b'\n');
    }

    fn process(&mut self, line: String) {
        self.command_log.push(line.clone());
        if self.swallow > 0 {
            self.swallow -= 1;
            return;
        }
        if let Some((prefix, left)) = &mut self.swallow_matching {
            if *left > 0 && line.starts_with(prefix.as_str()) {
                *left -= 1;
                return;
            }
        }

        let tag = line.split(':').next().unwrap_or("").to_string();
        let reply = match tag.as_str() {
            "#" => "#:AstroLink4mini".to_string(),
            "q" => self.telemetry_record(),
            "u" => record::join("u", &self.settings_main),
            "n" => record::join("n", &self.settings_other),
            "U" => {
                self.settings_main = line.split(':').skip(1).map(String::from).collect();
                line
            }
            "N" => {
                self.settings_other = line.split(':').skip(1).map(String::from).collect();
                line
            }
            "R" => {
                if let Some(pos) = line.split(':').nth(2).and_then(|v| v.parse().ok()) {
                    self.target = pos;
                }
                line
            }
            "P" => {
                if let Some(pos) = line.split(':').nth(1).and_then(|v| v.parse().ok()) {
                    self.position = pos;
                    self.target = pos;
                }
                line
            }
            "H" => {
                self.target = self.position;
                line
            }
            "C" => {
                let mut parts = line.split(':').skip(1);
                let index = parts.next().and_then(|v| v.parse::<usize>().ok());
                let on = parts.next().map(|v| v == "1").unwrap_or(false);
                if let Some(index) = index {
                    if index < self.relays.len() {
                        self.relays[index] = on;
                    }
                }
                // firmware acknowledges relay writes with a bare tag
                "C:".to_string()
            }
            "B" => {
                let mut parts = line.split(':').skip(1);
                let channel = parts.next().and_then(|v| v.parse::<usize>().ok());
                let duty = parts.next().and_then(|v| v.parse::<u8>().ok());
                if let (Some(channel), Some(duty)) = (channel, duty) {
                    if channel < self.pwm.len() {
                        self.pwm[channel] = duty;
                    }
                }
                line
            }
            "S" => {
                if let Some(steps) = line.split(':').nth(1).and_then(|v| v.parse::<i64>().ok()) {
                    self.position += steps;
                    self.target = self.position;
                    self.compensation_delta = 0;
                }
                line
            }
            "G" => {
                self.dc_polls_left = 2;
                line
            }
            "K" => {
                self.dc_polls_left = 0;
                line
            }
            _ => line,
        };
        self.respond(reply);
    }

    fn telemetry_record(&mut self) -> String {
        // advance the stepper toward its target, one slice per poll
        let remaining = self.target - self.position;
        if remaining != 0 {
            let step = remaining.clamp(-STEPS_PER_POLL, STEPS_PER_POLL);
            self.position += step;
        }
        let steps_to_go = (self.target - self.position).abs();
        if self.dc_polls_left > 0 {
            self.dc_polls_left -= 1;
        }

        let current = 1.47 + self.noise(0.05);
        if steps_to_go > 0 {
            // minimal record while the motor runs
            return format!("q:{}:{}:{:.2}", self.position, steps_to_go, current);
        }

        let temp = 2.12 + self.noise(0.1);
        let humidity = 45.1 + self.noise(0.4);
        let dewpoint = -12.81 + self.noise(0.1);
        let fields: Vec<String> = vec![
            self.position.to_string(),
            steps_to_go.to_string(),
            format!("{:.2}", current),
            "1".to_string(),
            format!("{:.2}", temp),
            format!("{:.1}", humidity),
            format!("{:.2}", dewpoint),
            "0".to_string(),
            "0".to_string(),
            self.pwm[0].to_string(),
            self.pwm[1].to_string(),
            u8::from(self.relays[0]).to_string(),
            u8::from(self.relays[1]).to_string(),
            u8::from(self.relays[2]).to_string(),
            "12.1".to_string(),
            "5.0".to_string(),
            "1.12".to_string(),
            "13.41".to_string(),
            u8::from(self.dc_polls_left > 0).to_string(),
            self.compensation_delta.to_string(),
            "0".to_string(),
            "0".to_string(),
        ];
        record::join("q", &fields)
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        if self.jitter {
            self.rng.gen_range(-amplitude..amplitude)
        } else {
            0.0
        }
    }
}

impl Default for SimulatedAstroLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for SimulatedAstroLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.response_queue.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.response_queue.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for SimulatedAstroLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.pending_input).into_owned();
                self.pending_input.clear();
                self.process(line);
            } else {
                self.pending_input.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for SimulatedAstroLink {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.response_queue.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.response_queue.len() as u32)
    }
}

/// Shared handle to a simulator
///
/// The connection takes one endpoint as its channel while the test (or demo
/// host) keeps the other to inspect and steer the simulated device.
#[derive(Clone)]
pub struct SharedSimulator {
    inner: Arc<Mutex<SimulatedAstroLink>>,
}

impl SharedSimulator {
    /// Wrap a simulator for shared access
    pub fn new(sim: SimulatedAstroLink) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sim)),
        }
    }

    /// A channel endpoint for [`Connection::over`](crate::protocol::Connection::over)
    pub fn channel(&self) -> Box<dyn CommunicationChannel> {
        Box::new(self.clone())
    }

    /// Run a closure against the simulated device
    pub fn with<R>(&self, f: impl FnOnce(&mut SimulatedAstroLink) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, SimulatedAstroLink>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "simulator lock poisoned"))
    }
}

impl Read for SharedSimulator {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.lock()?.read(buf)
    }
}

impl Write for SharedSimulator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl CommunicationChannel for SharedSimulator {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.lock()?.set_timeout(timeout)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.lock()?.clear_input_buffer()
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.lock()?.bytes_to_read()
    }
}
