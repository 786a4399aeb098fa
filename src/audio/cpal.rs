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
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, span, Level};

use super::thread_priority::CallbackPriority;
use super::{
    AudioBuffer, AudioError, EnqueueError, OutputQueue, StreamDescription, BUFFER_COUNT,
};
use crate::config;

/// Name that selects the host's default output device.
const DEFAULT_DEVICE: &str = "default";

/// A small wrapper around a cpal::Device. Used for storing some extra
/// data that makes opening output queues more convenient.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The maximum number of channels the device supports.
    max_channels: u16,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
    /// Sample rate to request from the device. The device default if unset.
    sample_rate: Option<u32>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

impl Device {
    /// Lists cpal devices and produces the Device trait.
    pub fn list() -> Result<Vec<Box<dyn super::Device>>, AudioError> {
        Ok(Device::list_cpal_devices()?
            .into_iter()
            .map(|device| {
                let device: Box<dyn super::Device> = Box::new(device);
                device
            })
            .collect())
    }

    /// Lists cpal devices that can output audio.
    fn list_cpal_devices() -> Result<Vec<Device>, AudioError> {
        // Suppress noisy output here.
        let _shh_stdout = shh::stdout()?;
        let _shh_stderr = shh::stderr()?;

        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host_devices = match cpal::host_from_id(host_id)?.devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let Ok(output_configs) = device.supported_output_configs() else {
                    continue;
                };
                let max_channels = output_configs
                    .map(|output_config| output_config.channels())
                    .max()
                    .unwrap_or(0);

                if max_channels > 0 {
                    devices.push(Device {
                        name: device.name()?,
                        max_channels,
                        host_id,
                        device,
                        sample_rate: None,
                    })
                }
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    /// Gets the given cpal device. "default" selects the default output device of the default
    /// host.
    pub fn get(config: &config::Audio) -> Result<Device, AudioError> {
        let name = config.device();
        let mut device = if name == DEFAULT_DEVICE {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| AudioError::NoDevice(name.to_string()))?;
            let max_channels = device.default_output_config()?.channels();
            Device {
                name: device.name()?,
                max_channels,
                host_id: host.id(),
                device,
                sample_rate: None,
            }
        } else {
            Device::list_cpal_devices()?
                .into_iter()
                .find(|device| device.name.trim() == name)
                .ok_or_else(|| AudioError::NoDevice(name.to_string()))?
        };

        device.sample_rate = config.sample_rate();
        Ok(device)
    }
}

impl super::Device for Device {
    fn new_output(
        &self,
        description: &StreamDescription,
        drained: Sender<AudioBuffer>,
    ) -> Result<Box<dyn OutputQueue>, AudioError> {
        let span = span!(Level::INFO, "new output (cpal)");
        let _enter = span.enter();

        let (submit_tx, submit_rx) = crossbeam_channel::bounded::<AudioBuffer>(BUFFER_COUNT);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let control = Arc::new(OutputControl::new(description.sample_rate as f64));

        let device = self.device.clone();
        let requested_rate = self.sample_rate;
        let source_channels = description.channels;
        let thread_control = control.clone();

        // The stream is created, played and dropped on this thread.
        let output_thread = thread::spawn(move || {
            let stream = match build_stream(
                &device,
                requested_rate,
                submit_rx,
                drained,
                thread_control,
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Blocks until the output queue is dropped.
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = output_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = output_thread.join();
                return Err(AudioError::OutputThreadExited);
            }
        }

        info!(
            device = self.name,
            stream = %description,
            source_channels,
            "Opened output."
        );

        Ok(Box::new(Output {
            name: self.name.clone(),
            submitted: submit_tx,
            control,
            shutdown: Some(shutdown_tx),
            output_thread: Some(output_thread),
        }))
    }
}

/// Builds an output stream in the device's default sample format.
fn build_stream(
    device: &cpal::Device,
    requested_rate: Option<u32>,
    submitted: Receiver<AudioBuffer>,
    drained: Sender<AudioBuffer>,
    control: Arc<OutputControl>,
) -> Result<cpal::Stream, AudioError> {
    let default_config = device.default_output_config()?;
    let sample_format = default_config.sample_format();
    let mut stream_config = default_config.config();
    if let Some(rate) = requested_rate {
        stream_config.sample_rate = rate;
    }

    let renderer = Renderer {
        submitted,
        drained,
        control,
        current: None,
        next: None,
        position: 0.0,
        device_rate: stream_config.sample_rate as f64,
        channels: stream_config.channels.max(1) as usize,
    };

    debug!(
        sample_rate = stream_config.sample_rate,
        channels = stream_config.channels,
        format = %sample_format,
        "Building output stream"
    );

    match sample_format {
        cpal::SampleFormat::F32 => build_typed_stream::<f32>(device, &stream_config, renderer),
        cpal::SampleFormat::I16 => build_typed_stream::<i16>(device, &stream_config, renderer),
        cpal::SampleFormat::I32 => build_typed_stream::<i32>(device, &stream_config, renderer),
        other => Err(AudioError::UnsupportedSampleFormat(other.to_string())),
    }
}

/// Renders into a reused f32 scratch buffer and converts to the device's sample type.
fn build_typed_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut renderer: Renderer,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let mut priority = CallbackPriority::from_env();
    let mut scratch: Vec<f32> = Vec::new();
    Ok(device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            priority.apply();
            scratch.resize(data.len(), 0.0);
            renderer.render(&mut scratch);
            for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                *dst = T::from_sample(src);
            }
        },
        |err| error!("CPAL output stream error: {}", err),
        None,
    )?)
}

/// State shared between an output queue and its callback.
struct OutputControl {
    running: AtomicBool,
    flush: AtomicBool,
    /// Playback rate in frames per second, stored as f64 bits.
    rate_bits: AtomicU64,
}

impl OutputControl {
    fn new(rate: f64) -> OutputControl {
        OutputControl {
            running: AtomicBool::new(false),
            flush: AtomicBool::new(false),
            rate_bits: AtomicU64::new(rate.to_bits()),
        }
    }

    fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }
}

/// Plays submitted buffers back to back at the playback rate.
struct Renderer {
    submitted: Receiver<AudioBuffer>,
    drained: Sender<AudioBuffer>,
    control: Arc<OutputControl>,
    current: Option<AudioBuffer>,
    /// The buffer after the current one, once the position reaches the current one's last frame.
    next: Option<AudioBuffer>,
    /// Fractional frame position within the current buffer.
    position: f64,
    device_rate: f64,
    channels: usize,
}

impl Renderer {
    /// Fills `out` with interleaved samples for the device.
    fn render(&mut self, out: &mut [f32]) {
        if self.control.flush.swap(false, Ordering::AcqRel) {
            self.flush();
        }
        if !self.control.running.load(Ordering::Acquire) {
            out.fill(0.0);
            return;
        }

        let step = self.control.rate() / self.device_rate;
        for frame in out.chunks_mut(self.channels) {
            self.advance();
            let Some(buffer) = self.current.as_ref() else {
                frame.fill(0.0);
                continue;
            };

            let index = self.position as usize;
            let fraction = (self.position - index as f64) as f32;
            let at_seam = index + 1 >= buffer.frames();
            if at_seam && self.next.is_none() {
                self.next = self.submitted.try_recv().ok();
            }

            let source_channels = buffer.channels() as usize;
            for (channel, sample) in frame.iter_mut().enumerate() {
                let a = buffer.sample(index, channel % source_channels);
                // The last frame of a buffer interpolates towards the first of the next one.
                let b = match (at_seam, self.next.as_ref()) {
                    (true, Some(next)) => next.sample(0, channel % next.channels() as usize),
                    _ => buffer.sample(index + 1, channel % source_channels),
                };
                *sample = a + (b - a) * fraction;
            }
            self.position += step;
        }
    }

    /// Moves on to the buffer holding the current position, handing back any buffer that has
    /// been played out.
    fn advance(&mut self) {
        loop {
            let frames = match self.current.as_ref() {
                Some(buffer) => buffer.frames() as f64,
                None => match self.next.take().or_else(|| self.submitted.try_recv().ok()) {
                    Some(buffer) => {
                        self.current = Some(buffer);
                        continue;
                    }
                    None => return,
                },
            };
            if self.position < frames {
                return;
            }
            self.position -= frames;
            if let Some(buffer) = self.current.take() {
                // Sized for the whole pool, so this never blocks or allocates.
                let _ = self.drained.try_send(buffer);
            }
        }
    }

    /// Hands back every buffer without playing it.
    fn flush(&mut self) {
        self.position = 0.0;
        let pending = self.current.take().into_iter().chain(self.next.take());
        for buffer in pending {
            let _ = self.drained.try_send(buffer);
        }
        while let Ok(buffer) = self.submitted.try_recv() {
            let _ = self.drained.try_send(buffer);
        }
    }
}

/// The output queue of a cpal device.
struct Output {
    name: String,
    submitted: Sender<AudioBuffer>,
    control: Arc<OutputControl>,
    shutdown: Option<Sender<()>>,
    output_thread: Option<thread::JoinHandle<()>>,
}

impl OutputQueue for Output {
    fn enqueue(&mut self, buffer: AudioBuffer) -> Result<(), EnqueueError> {
        self.submitted.try_send(buffer).map_err(|e| EnqueueError {
            reason: e.to_string(),
            buffer: e.into_inner(),
        })
    }

    fn set_playback_rate(&mut self, frames_per_second: f64) {
        self.control
            .rate_bits
            .store(frames_per_second.to_bits(), Ordering::Release);
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.control.running.store(true, Ordering::Release);
        debug!(device = self.name, "Started output.");
        Ok(())
    }

    fn stop(&mut self, immediate: bool) {
        self.control.running.store(false, Ordering::Release);
        if immediate {
            self.control.flush.store(true, Ordering::Release);
        }
        debug!(device = self.name, immediate, "Stopped output.");
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        // Closing the shutdown channel releases the output thread.
        self.shutdown.take();
        if let Some(thread) = self.output_thread.take() {
            let _ = thread.join();
        }
    }
}
