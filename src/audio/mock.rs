// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, span, Level};

use super::{AudioBuffer, AudioError, EnqueueError, OutputQueue, StreamDescription};

/// How often the automatic drain thread hands a buffer back.
const DRAIN_INTERVAL: Duration = Duration::from_millis(1);

/// Counters recorded by the mock device across all of its outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    /// Buffers enqueued in total.
    pub enqueued: usize,
    /// Buffers handed back in total.
    pub drained: usize,
    /// The most buffers the device held at once.
    pub max_outstanding: usize,
    /// Calls to start.
    pub starts: usize,
    /// Buffers queued at each call to start.
    pub queued_at_start: Vec<usize>,
    /// Calls to stop.
    pub stops: usize,
    /// Every playback rate set, in order.
    pub rates: Vec<f64>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<AudioBuffer>,
    running: bool,
    drained: Option<Sender<AudioBuffer>>,
    stats: Stats,
}

impl State {
    /// Hands the oldest queued buffer back. Returns false if nothing was queued.
    fn drain_one(&mut self) -> bool {
        let Some(buffer) = self.queue.pop_front() else {
            return false;
        };
        self.stats.drained += 1;
        if let Some(drained) = self.drained.as_ref() {
            // The receiver only goes away when the queue owner shuts down.
            let _ = drained.send(buffer);
        }
        true
    }
}

/// A mock device. Doesn't actually play anything.
///
/// In automatic mode a background thread drains buffers as soon as the output is started. In
/// manual mode nothing drains until [`Device::complete_next`] is called, which lets tests
/// control exactly when each "device callback" fires.
#[derive(Clone)]
pub struct Device {
    name: String,
    manual: bool,
    state: Arc<Mutex<State>>,
}

impl Device {
    /// Gets the given mock device, draining automatically.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
            manual: false,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Gets a mock device that only drains when told to.
    pub fn manual(name: &str) -> Device {
        Device {
            manual: true,
            ..Device::get(name)
        }
    }

    /// Drains the oldest queued buffer, regardless of whether the output is running.
    pub fn complete_next(&self) -> bool {
        self.state.lock().drain_one()
    }

    /// The number of buffers the device currently holds.
    pub fn outstanding(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns true if the output is started.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().stats.clone()
    }
}

impl super::Device for Device {
    fn new_output(
        &self,
        description: &StreamDescription,
        drained: Sender<AudioBuffer>,
    ) -> Result<Box<dyn OutputQueue>, AudioError> {
        let span = span!(Level::INFO, "new output (mock)");
        let _enter = span.enter();

        info!(device = self.name, stream = %description, "Opening output.");

        {
            let mut state = self.state.lock();
            state.queue.clear();
            state.running = false;
            state.drained = Some(drained);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let drain_thread = if self.manual {
            None
        } else {
            let state = self.state.clone();
            let shutdown = shutdown.clone();
            Some(thread::spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    {
                        let mut state = state.lock();
                        if state.running {
                            state.drain_one();
                        }
                    }
                    thread::sleep(DRAIN_INTERVAL);
                }
            }))
        };

        Ok(Box::new(Output {
            name: self.name.clone(),
            state: self.state.clone(),
            shutdown,
            drain_thread,
        }))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

/// The output queue of a mock device.
struct Output {
    name: String,
    state: Arc<Mutex<State>>,
    shutdown: Arc<AtomicBool>,
    drain_thread: Option<thread::JoinHandle<()>>,
}

impl OutputQueue for Output {
    fn enqueue(&mut self, buffer: AudioBuffer) -> Result<(), EnqueueError> {
        let mut state = self.state.lock();
        state.queue.push_back(buffer);
        state.stats.enqueued += 1;
        state.stats.max_outstanding = state.stats.max_outstanding.max(state.queue.len());
        Ok(())
    }

    fn set_playback_rate(&mut self, frames_per_second: f64) {
        self.state.lock().stats.rates.push(frames_per_second);
    }

    fn start(&mut self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        state.running = true;
        state.stats.starts += 1;
        let queued = state.queue.len();
        state.stats.queued_at_start.push(queued);
        debug!(device = self.name, queued, "Started output.");
        Ok(())
    }

    fn stop(&mut self, immediate: bool) {
        let mut state = self.state.lock();
        state.running = false;
        state.stats.stops += 1;
        // Manual devices keep their buffers so tests decide when they come back.
        if immediate && self.drain_thread.is_some() {
            while state.drain_one() {}
        }
        debug!(device = self.name, immediate, "Stopped output.");
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.drain_thread.take() {
            let _ = thread.join();
        }
    }
}
