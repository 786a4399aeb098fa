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
use std::path::PathBuf;

use crate::audio::error::AudioError;

/// Errors surfaced by the melody queue and its playback engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to read instrument file {}: {source}", .path.display())]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported instrument format {}: {reason}", .path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("Malformed note '{token}' at column {column}")]
    MalformedNote { token: String, column: usize },

    #[error("Unable to allocate a {bytes} byte audio buffer")]
    BufferAllocationFailure { bytes: usize },

    #[error("Audio device error: {0}")]
    Device(#[from] AudioError),

    #[error("Decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),
}
