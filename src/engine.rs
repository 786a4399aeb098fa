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

//! The playback engine.
//!
//! Plays one note at a time by streaming the instrument through a fixed pool of buffers. Every
//! buffer cycles free -> filled -> submitted -> free: the engine fills it from the instrument,
//! the output device plays it and sends it back, and the engine refills the same slot.
//!
//! Drained buffers must be handed to [`PlaybackEngine::on_buffer_drained`] one at a time. The
//! engine is not shared between threads, so the buffer state machine needs no locking.

use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, trace, warn};

use crate::audio::{
    AudioBuffer, BufferPool, BufferSizing, Device, InstrumentSource, Occupancy, OutputQueue,
    BUFFER_COUNT,
};
use crate::error::Error;
use crate::melody::{pitch_ratio, Note, Pitch, MIDDLE_C};

/// Quarter notes per minute when no tempo is configured.
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

/// Parameters that apply to every note played.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSettings {
    /// The pitch the instrument sample was recorded at.
    pub native_pitch: Pitch,
    /// Quarter notes per minute.
    pub tempo_bpm: f64,
    /// Seconds of audio per buffer.
    pub buffer_seconds: f64,
    /// Wait before the first note of each melody.
    pub playback_delay: Duration,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        PlaybackSettings {
            native_pitch: Pitch::from_midi(MIDDLE_C),
            tempo_bpm: DEFAULT_TEMPO_BPM,
            buffer_seconds: crate::audio::buffer::DEFAULT_BUFFER_SECONDS,
            playback_delay: Duration::ZERO,
        }
    }
}

/// What happened to the current note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteProgress {
    /// The note is still playing.
    Playing,
    /// Every buffer of the note has been played and returned.
    Finished,
    /// The buffer belonged to an earlier note and was ignored.
    Stale,
}

/// The playback of a single note.
#[derive(Debug, Clone)]
pub struct Session {
    generation: u64,
    note: Note,
    pitch_ratio: f64,
    /// Set once the instrument has nothing more to give for this note. Never unset.
    done: bool,
    /// Buffers currently held by the device for this session.
    outstanding: usize,
    /// Source frames still allowed for this note.
    frames_remaining: u64,
    /// False while buffers of an earlier session are still with the device.
    primed: bool,
}

impl Session {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn note(&self) -> &Note {
        &self.note
    }

    pub fn pitch_ratio(&self) -> f64 {
        self.pitch_ratio
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Streams the instrument to an output device, re-pitched per note.
pub struct PlaybackEngine {
    source: InstrumentSource,
    pool: BufferPool,
    output: Box<dyn OutputQueue>,
    packets_per_buffer: usize,
    settings: PlaybackSettings,
    /// Incremented for every note. Buffers carry the generation they were submitted under.
    generation: u64,
    session: Option<Session>,
    sessions_started: u64,
}

impl PlaybackEngine {
    /// Sizes and allocates the buffer pool and opens an output on the device. Drained buffers
    /// are sent to `drained`.
    pub fn new(
        source: InstrumentSource,
        device: &dyn Device,
        drained: Sender<AudioBuffer>,
        settings: PlaybackSettings,
    ) -> Result<PlaybackEngine, Error> {
        let description = source.description().clone();
        let sizing = BufferSizing::derive(&description, settings.buffer_seconds);
        let packets_per_buffer = sizing.packets_per_buffer;
        // Packet descriptions are only kept for formats with variable packets.
        let max_packets = (!description.constant_frames).then_some(packets_per_buffer);

        let pool = BufferPool::allocate(
            BUFFER_COUNT,
            sizing.capacity_bytes,
            description.channels,
            max_packets,
        )?;
        let output = device.new_output(&description, drained)?;

        info!(
            device = %device,
            instrument = ?source.path(),
            capacity_bytes = sizing.capacity_bytes,
            packets_per_buffer,
            "Playback engine ready"
        );

        Ok(PlaybackEngine {
            source,
            pool,
            output,
            packets_per_buffer,
            settings,
            generation: 0,
            session: None,
            sessions_started: 0,
        })
    }

    /// Starts playing a note, ending any note still playing.
    ///
    /// Returns [`NoteProgress::Finished`] if the instrument has nothing to play for the note.
    pub fn start_note(&mut self, note: Note) -> Result<NoteProgress, Error> {
        if self.session.is_some() {
            self.playback_stopped();
        }

        self.generation += 1;
        self.sessions_started += 1;
        self.source.reset_cursor()?;

        let sample_rate = self.source.description().sample_rate as f64;
        let ratio = pitch_ratio(note.pitch.semitones_from(self.settings.native_pitch));
        let seconds = note.length.seconds(self.settings.tempo_bpm);
        let frames_remaining = (seconds * sample_rate * ratio).round().max(0.0) as u64;

        self.output.set_playback_rate(ratio * sample_rate);
        self.session = Some(Session {
            generation: self.generation,
            note,
            pitch_ratio: ratio,
            done: false,
            outstanding: 0,
            frames_remaining,
            primed: false,
        });

        debug!(
            generation = self.generation,
            note = %note,
            ratio,
            frames = frames_remaining,
            "Starting note"
        );

        if self.pool.occupancy().submitted > 0 {
            // The device still holds buffers from the last note. Prime once they're back.
            debug!(
                generation = self.generation,
                "Deferring priming until earlier buffers return"
            );
            return Ok(NoteProgress::Playing);
        }
        self.prime()
    }

    /// Handles a buffer the device has finished playing.
    pub fn on_buffer_drained(&mut self, buffer: AudioBuffer) -> Result<NoteProgress, Error> {
        let slot = buffer.slot();
        let generation = match self.pool.release(buffer) {
            Ok(generation) => generation,
            Err(buffer) => {
                warn!(
                    slot = buffer.slot(),
                    generation = buffer.generation(),
                    "Drained buffer doesn't match a submitted slot"
                );
                return Ok(NoteProgress::Stale);
            }
        };

        let Some(session) = self.session.as_mut() else {
            trace!(slot, generation, "Buffer drained with no note playing");
            return Ok(NoteProgress::Stale);
        };

        if generation != session.generation {
            trace!(
                slot,
                generation,
                current = session.generation,
                "Ignoring buffer from an earlier note"
            );
            if !session.primed && self.pool.occupancy().submitted == 0 {
                return self.prime();
            }
            return Ok(NoteProgress::Stale);
        }

        session.outstanding = session.outstanding.saturating_sub(1);
        if self.fill(slot) && self.submit(slot) {
            return Ok(NoteProgress::Playing);
        }

        match self.session.as_ref() {
            Some(session) if session.done && session.outstanding == 0 => {
                debug!(generation = session.generation, "Note finished");
                Ok(NoteProgress::Finished)
            }
            _ => Ok(NoteProgress::Playing),
        }
    }

    /// Stops the output and ends the current note. Buffers still with the device come back
    /// later and are ignored.
    pub fn playback_stopped(&mut self) {
        let submitted = self.pool.occupancy().submitted;
        self.output.stop(submitted > 0);
        if let Some(session) = self.session.take() {
            debug!(
                generation = session.generation,
                outstanding = submitted,
                "Playback stopped"
            );
        }
    }

    pub fn occupancy(&self) -> Occupancy {
        self.pool.occupancy()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started
    }

    /// Fills and submits every free buffer, then starts the output.
    fn prime(&mut self) -> Result<NoteProgress, Error> {
        let mut submitted = 0;
        for slot in self.pool.free_slots() {
            if !(self.fill(slot) && self.submit(slot)) {
                break;
            }
            submitted += 1;
        }

        let Some(session) = self.session.as_mut() else {
            return Ok(NoteProgress::Stale);
        };
        session.primed = true;

        if submitted == 0 {
            session.done = true;
            debug!(generation = session.generation, "Nothing to play for note");
            return Ok(NoteProgress::Finished);
        }

        self.output.start()?;
        Ok(NoteProgress::Playing)
    }

    /// Reads the next stretch of the instrument into a free slot. Returns false, marking the
    /// session done, when there is nothing left to read.
    fn fill(&mut self, slot: usize) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.done {
            return false;
        }
        if session.frames_remaining == 0 {
            session.done = true;
            return false;
        }
        let Some(buffer) = self.pool.buffer_mut(slot) else {
            return false;
        };

        match self.source.read_packets(
            buffer,
            self.packets_per_buffer,
            Some(session.frames_remaining),
        ) {
            Ok(read) if read.frames > 0 => {
                session.frames_remaining = session.frames_remaining.saturating_sub(read.frames);
                self.pool.mark_filled(slot)
            }
            Ok(_) => {
                session.done = true;
                false
            }
            Err(e) => {
                warn!(
                    err = %e,
                    generation = session.generation,
                    "Unable to read instrument, ending note"
                );
                session.done = true;
                false
            }
        }
    }

    /// Hands a filled slot to the device.
    fn submit(&mut self, slot: usize) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(buffer) = self.pool.submit(slot, session.generation) else {
            return false;
        };

        match self.output.enqueue(buffer) {
            Ok(()) => {
                session.outstanding += 1;
                true
            }
            Err(e) => {
                warn!(
                    err = %e,
                    generation = session.generation,
                    "Output refused buffer, ending note"
                );
                let _ = self.pool.release(e.buffer);
                session.done = true;
                false
            }
        }
    }
}
