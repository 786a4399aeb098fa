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
use super::buffer::AudioBuffer;

/// Error types for output devices and their queues
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No device found with name {0}")]
    NoDevice(String),

    #[error("Unable to list devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("Unable to read device name: {0}")]
    DeviceName(#[from] cpal::DeviceNameError),

    #[error("Unable to get host: {0}")]
    Host(#[from] cpal::HostUnavailable),

    #[error("Unable to query output configuration: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("Unable to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Unable to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Unsupported output sample format {0}")]
    UnsupportedSampleFormat(String),

    #[error("Output thread exited before the stream was ready")]
    OutputThreadExited,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Returned when an output queue refuses a buffer. The buffer is handed back so
/// that its slot can be returned to the pool.
#[derive(Debug, thiserror::Error)]
#[error("Output queue rejected buffer in slot {}: {reason}", .buffer.slot())]
pub struct EnqueueError {
    pub buffer: AudioBuffer,
    pub reason: String,
}
