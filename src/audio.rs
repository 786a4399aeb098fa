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
use std::{any::Any, fmt, sync::Arc};

use crossbeam_channel::Sender;

use crate::config;

pub mod buffer;
pub mod cpal;
pub mod error;
pub mod mock;
pub mod source;
mod thread_priority;

pub use buffer::{AudioBuffer, BufferPool, BufferSizing, Occupancy, BUFFER_COUNT};
pub use error::{AudioError, EnqueueError};
pub use source::{InstrumentSource, StreamDescription};

/// An output device that can open buffer queues.
pub trait Device: Any + fmt::Display + std::marker::Send + std::marker::Sync {
    /// Opens an output queue for the given stream. Every buffer enqueued on it is sent back
    /// through `drained` once the device has finished playing it.
    fn new_output(
        &self,
        description: &StreamDescription,
        drained: Sender<AudioBuffer>,
    ) -> Result<Box<dyn OutputQueue>, AudioError>;
}

/// A queue of buffers feeding one output stream.
///
/// Buffers are played in the order they were enqueued. Drained buffers are handed back on a
/// single thread, in the same order, so the receiver sees them serialized.
pub trait OutputQueue: std::marker::Send {
    /// Hands a buffer to the device.
    fn enqueue(&mut self, buffer: AudioBuffer) -> Result<(), EnqueueError>;

    /// Sets the rate, in frames per second, at which buffers are consumed. The nominal sample
    /// rate plays at the original pitch; multiples of it shift the pitch.
    fn set_playback_rate(&mut self, frames_per_second: f64);

    /// Starts consuming buffers.
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stops consuming buffers. When `immediate` is set, anything still queued is handed back
    /// through the drained channel without being played.
    fn stop(&mut self, immediate: bool);
}

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, AudioError> {
    cpal::Device::list()
}

/// Gets a device with the given configuration.
pub fn get_device(config: &config::Audio) -> Result<Arc<dyn Device>, AudioError> {
    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(device)));
    };

    Ok(Arc::new(cpal::Device::get(config)?))
}
