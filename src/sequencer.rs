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
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, span, Level};

use crate::audio::{AudioBuffer, Device, InstrumentSource, BUFFER_COUNT};
use crate::engine::{NoteProgress, PlaybackEngine, PlaybackSettings};
use crate::error::Error;
use crate::melody::{self, Note};

#[cfg(test)]
mod tests;

/// Commands sent from the control side to the event loop.
enum Command {
    /// Start the melody with the given number.
    Play(u64),
    /// Abandon whatever is playing.
    Stop,
    Shutdown,
}

/// The note queue and its playing flag. Guarded by one lock so that appending and advancing
/// never interleave.
struct QueueState {
    notes: VecDeque<Note>,
    playing: bool,
    current: Option<Note>,
    /// Bumped by every play and stop. The event loop only advances the melody it was told to
    /// play.
    melody: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Signalled whenever playing goes false.
    idle: Condvar,
    sessions_started: AtomicU64,
    melodies_completed: AtomicU64,
}

/// Counters for a melody queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Notes started.
    pub sessions_started: u64,
    /// Melodies played through to the end of the queue.
    pub melodies_completed: u64,
}

/// Plays queued notes with a single instrument, one after the other.
///
/// Notes may be added at any time, including while a melody is playing. Playback runs on a
/// dedicated event loop thread; nothing here blocks on the device.
pub struct MelodyQueue {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    device: Arc<dyn Device>,
    event_loop: Option<thread::JoinHandle<()>>,
}

impl MelodyQueue {
    /// Opens the instrument and an output on the device. Every setup failure is returned here.
    pub fn with_instrument<P: AsRef<Path>>(
        path: P,
        device: Arc<dyn Device>,
        settings: PlaybackSettings,
    ) -> Result<MelodyQueue, Error> {
        let source = InstrumentSource::open(path)?;
        // Holds every buffer of the pool at once, so the output never waits to hand one back.
        let (drained_tx, drained_rx) = crossbeam_channel::bounded::<AudioBuffer>(BUFFER_COUNT);
        let playback_delay = settings.playback_delay;
        let engine = PlaybackEngine::new(source, device.as_ref(), drained_tx, settings)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                notes: VecDeque::new(),
                playing: false,
                current: None,
                melody: 0,
            }),
            idle: Condvar::new(),
            sessions_started: AtomicU64::new(0),
            melodies_completed: AtomicU64::new(0),
        });

        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let event_loop = EventLoop {
            engine,
            shared: shared.clone(),
            commands: commands_rx,
            drained: drained_rx,
            playback_delay,
            melody: None,
        };
        let event_loop = thread::spawn(move || event_loop.run());

        Ok(MelodyQueue {
            shared,
            commands: commands_tx,
            device,
            event_loop: Some(event_loop),
        })
    }

    /// Appends a single note token.
    pub fn add_note(&self, token: &str) -> Result<(), Error> {
        let note = melody::parse_note(token)?;
        self.enqueue(note);
        Ok(())
    }

    /// Appends every note of a melody, or none of them if any token is malformed. Returns the
    /// number of notes added.
    pub fn add_melody(&self, text: &str) -> Result<usize, Error> {
        let notes = melody::parse_melody(text)?;
        let count = notes.len();
        self.shared.state.lock().notes.extend(notes);
        debug!(notes = count, "Added melody");
        Ok(count)
    }

    /// Appends an already parsed note.
    pub fn enqueue(&self, note: Note) {
        self.shared.state.lock().notes.push_back(note);
    }

    /// Plays the queued notes. Does nothing if a melody is already playing; notes added while
    /// playing are picked up by the running melody.
    pub fn play(&self) {
        let melody = {
            let mut state = self.shared.state.lock();
            if state.playing {
                debug!("Melody already playing");
                return;
            }
            state.playing = true;
            state.melody += 1;
            state.melody
        };

        if self.commands.send(Command::Play(melody)).is_err() {
            error!("Melody event loop has exited");
            let mut state = self.shared.state.lock();
            state.playing = false;
            self.shared.idle.notify_all();
        }
    }

    /// Drops the remaining notes and stops the note that is playing.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.notes.clear();
            state.current = None;
            state.playing = false;
            state.melody += 1;
            self.shared.idle.notify_all();
        }
        let _ = self.commands.send(Command::Stop);
    }

    /// Notes still waiting to be played, in order.
    pub fn pending_notes(&self) -> Vec<Note> {
        self.shared.state.lock().notes.iter().copied().collect()
    }

    /// The note playing now, if any.
    pub fn current_note(&self) -> Option<Note> {
        self.shared.state.lock().current
    }

    pub fn is_playing(&self) -> bool {
        self.shared.state.lock().playing
    }

    pub fn stats(&self) -> Stats {
        Stats {
            sessions_started: self.shared.sessions_started.load(Ordering::Acquire),
            melodies_completed: self.shared.melodies_completed.load(Ordering::Acquire),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Blocks until no melody is playing.
    pub fn wait_until_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.playing {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Blocks until no melody is playing or the timeout passes. Returns true if idle.
    pub fn wait_until_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.playing {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return !state.playing;
            }
        }
        true
    }
}

impl Drop for MelodyQueue {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(event_loop) = self.event_loop.take() {
            if event_loop.join().is_err() {
                error!("Melody event loop panicked");
            }
        }
    }
}

/// Owns the engine. Handles commands and drained buffers one at a time.
struct EventLoop {
    engine: PlaybackEngine,
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    drained: Receiver<AudioBuffer>,
    playback_delay: Duration,
    /// The melody being played, if any.
    melody: Option<u64>,
}

impl EventLoop {
    fn run(mut self) {
        let span = span!(Level::INFO, "melody event loop");
        let _enter = span.enter();

        let commands = self.commands.clone();
        let drained = self.drained.clone();
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Play(melody)) => self.play(melody),
                    Ok(Command::Stop) => self.stop(),
                    Ok(Command::Shutdown) | Err(_) => break,
                },
                recv(drained) -> buffer => match buffer {
                    Ok(buffer) => self.buffer_drained(buffer),
                    Err(_) => break,
                },
            }
        }

        self.engine.playback_stopped();
        debug!("Melody event loop exited");
    }

    fn play(&mut self, melody: u64) {
        if self.melody.is_some() {
            self.engine.playback_stopped();
        }
        self.melody = Some(melody);

        if !self.playback_delay.is_zero() {
            spin_sleep::sleep(self.playback_delay);
        }
        info!(melody, "Playing melody");
        self.advance();
    }

    fn stop(&mut self) {
        if self.melody.take().is_some() || self.engine.session().is_some() {
            self.engine.playback_stopped();
            info!("Melody stopped");
        }
    }

    fn buffer_drained(&mut self, buffer: AudioBuffer) {
        match self.engine.on_buffer_drained(buffer) {
            Ok(NoteProgress::Finished) => self.advance(),
            Ok(NoteProgress::Playing) | Ok(NoteProgress::Stale) => {}
            Err(e) => {
                error!(err = %e, "Playback failed, moving to the next note");
                self.advance();
            }
        }
    }

    /// Starts the next queued note, or finishes the melody if there is none.
    fn advance(&mut self) {
        let Some(melody) = self.melody else {
            return;
        };

        loop {
            let note = {
                let mut state = self.shared.state.lock();
                if state.melody != melody {
                    // Stopped or restarted from the control side.
                    drop(state);
                    self.engine.playback_stopped();
                    self.melody = None;
                    return;
                }

                match state.notes.pop_front() {
                    Some(note) => {
                        state.current = Some(note);
                        note
                    }
                    None => {
                        state.playing = false;
                        state.current = None;
                        drop(state);

                        self.engine.playback_stopped();
                        self.melody = None;
                        let completed = self
                            .shared
                            .melodies_completed
                            .fetch_add(1, Ordering::AcqRel)
                            + 1;
                        self.shared.idle.notify_all();
                        info!(melody, completed, "Melody finished");
                        return;
                    }
                }
            };

            self.shared.sessions_started.fetch_add(1, Ordering::AcqRel);
            match self.engine.start_note(note) {
                Ok(NoteProgress::Finished) => debug!(note = %note, "Nothing to play for note"),
                Ok(_) => return,
                Err(e) => error!(err = %e, note = %note, "Unable to start note"),
            }
        }
    }
}
