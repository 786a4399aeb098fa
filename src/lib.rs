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

//! Plays melodies by re-pitching a single instrument sample.
//!
//! A [`MelodyQueue`] owns one instrument and one output device. Notes are queued with
//! [`MelodyQueue::add_note`] or [`MelodyQueue::add_melody`] and played in order with
//! [`MelodyQueue::play`]. Each note replays the instrument from the start at a playback rate
//! scaled by the note's distance from the instrument's recorded pitch.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod melody;
pub mod sequencer;
#[cfg(test)]
mod testutil;

pub use error::Error;
pub use sequencer::MelodyQueue;
