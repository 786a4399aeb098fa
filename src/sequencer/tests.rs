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
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use super::*;
use crate::audio::{mock, AudioError, OutputQueue, StreamDescription, BUFFER_COUNT};
use crate::melody::parse_note;
use crate::testutil::{eventually, write_sine_wav};

const TIMEOUT: Duration = Duration::from_secs(10);

/// A tenth of a second of 44.1kHz mono audio.
fn short_instrument(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("short.wav");
    write_sine_wav(&path, 1, 44100, 4410).unwrap();
    path
}

/// A second of 44.1kHz mono audio, several buffers long.
fn long_instrument(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("long.wav");
    write_sine_wav(&path, 1, 44100, 44100).unwrap();
    path
}

fn queue(path: &Path, device: &mock::Device) -> MelodyQueue {
    MelodyQueue::with_instrument(path, Arc::new(device.clone()), PlaybackSettings::default())
        .unwrap()
}

/// Drains a manual device until the queue stops playing.
fn pump_until_idle(queue: &MelodyQueue, device: &mock::Device) {
    let start = Instant::now();
    while queue.is_playing() {
        device.complete_next();
        thread::sleep(Duration::from_micros(200));
        assert!(start.elapsed() < TIMEOUT, "melody never finished");
    }
}

/// A mock device that counts output stops made while the note queue is locked.
struct LockWatchingDevice {
    inner: mock::Device,
    shared: Arc<Mutex<Weak<Shared>>>,
    stops_while_locked: Arc<AtomicUsize>,
}

impl fmt::Display for LockWatchingDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (lock watching)", self.inner)
    }
}

impl Device for LockWatchingDevice {
    fn new_output(
        &self,
        description: &StreamDescription,
        drained: Sender<AudioBuffer>,
    ) -> Result<Box<dyn OutputQueue>, AudioError> {
        Ok(Box::new(LockWatchingOutput {
            inner: self.inner.new_output(description, drained)?,
            shared: self.shared.clone(),
            stops_while_locked: self.stops_while_locked.clone(),
        }))
    }
}

struct LockWatchingOutput {
    inner: Box<dyn OutputQueue>,
    shared: Arc<Mutex<Weak<Shared>>>,
    stops_while_locked: Arc<AtomicUsize>,
}

impl OutputQueue for LockWatchingOutput {
    fn enqueue(&mut self, buffer: AudioBuffer) -> Result<(), crate::audio::EnqueueError> {
        self.inner.enqueue(buffer)
    }

    fn set_playback_rate(&mut self, frames_per_second: f64) {
        self.inner.set_playback_rate(frames_per_second)
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.inner.start()
    }

    fn stop(&mut self, immediate: bool) {
        if let Some(shared) = self.shared.lock().upgrade() {
            if shared.state.try_lock().is_none() {
                self.stops_while_locked.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.inner.stop(immediate)
    }
}

#[test]
fn test_plays_each_note_once_and_completes_once() {
    let dir = tempfile::tempdir().unwrap();
    let device = mock::Device::get("mock");
    let queue = queue(&short_instrument(&dir), &device);

    assert_eq!(queue.add_melody("C D E").unwrap(), 3);
    queue.play();
    assert!(queue.wait_until_idle_timeout(TIMEOUT));

    let stats = queue.stats();
    assert_eq!(stats.sessions_started, 3);
    assert_eq!(stats.melodies_completed, 1);
    assert!(queue.pending_notes().is_empty());
    assert!(queue.current_note().is_none());

    // One playback rate per note, in order.
    let rates = device.stats().rates;
    assert_eq!(rates.len(), 3);
    assert!(rates[0] < rates[1] && rates[1] < rates[2]);
}

#[test]
fn test_play_while_playing_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let device = mock::Device::get("mock");
    let queue = queue(&short_instrument(&dir), &device);

    queue.add_melody("C D E").unwrap();
    queue.play();
    queue.play();
    queue.play();
    assert!(queue.wait_until_idle_timeout(TIMEOUT));

    assert_eq!(queue.stats().sessions_started, 3);
    assert_eq!(queue.stats().melodies_completed, 1);
    assert!(device.stats().max_outstanding <= BUFFER_COUNT);
}

#[test]
fn test_play_with_empty_queue_completes_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let device = mock::Device::get("mock");
    let queue = queue(&short_instrument(&dir), &device);

    queue.play();
    assert!(queue.wait_until_idle_timeout(TIMEOUT));
    eventually(
        || queue.stats().melodies_completed == 1,
        "empty melody never completed",
    );
    assert_eq!(queue.stats().sessions_started, 0);
    assert_eq!(device.stats().starts, 0);
}

#[test]
fn test_malformed_melody_leaves_queue_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let device = mock::Device::manual("mock");
    let queue = queue(&short_instrument(&dir), &device);

    queue.add_melody("C D").unwrap();
    let before = queue.pending_notes();

    match queue.add_melody("C D #badtoken") {
        Err(Error::MalformedNote { token, column }) => {
            assert_eq!(token, "#badtoken");
            assert_eq!(column, 5);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(queue.pending_notes(), before);

    assert!(matches!(queue.add_note("X"), Err(Error::MalformedNote { .. })));
    assert_eq!(queue.pending_notes(), before);
}

#[test]
fn test_add_melody_matches_add_note() {
    let dir = tempfile::tempdir().unwrap();
    let path = short_instrument(&dir);
    let device = mock::Device::manual("mock");
    let melody = "E5e D#5e E5e D#5e E5e B4e D5e C5e A4q.";

    let by_melody = queue(&path, &device);
    by_melody.add_melody(melody).unwrap();

    let by_note = queue(&path, &device);
    for token in melody.split_whitespace() {
        by_note.add_note(token).unwrap();
    }

    assert_eq!(by_melody.pending_notes(), by_note.pending_notes());
    assert_eq!(by_melody.pending_notes().len(), 9);
}

#[test]
fn test_notes_added_while_playing_are_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let device = mock::Device::manual("mock");
    let queue = queue(&long_instrument(&dir), &device);

    queue.add_melody("C D").unwrap();
    queue.play();
    eventually(|| device.outstanding() > 0, "first note never started");
    assert!(queue.is_playing());
    assert_eq!(queue.current_note(), Some(parse_note("C").unwrap()));

    queue.add_melody("E F").unwrap();
    queue.add_note("G").unwrap();
    pump_until_idle(&queue, &device);

    let stats = queue.stats();
    assert_eq!(stats.sessions_started, 5);
    assert_eq!(stats.melodies_completed, 1);
    assert!(device.stats().max_outstanding <= BUFFER_COUNT);
}

#[test]
fn test_stop_abandons_melody() {
    let dir = tempfile::tempdir().unwrap();
    let device = mock::Device::manual("mock");
    let queue = queue(&long_instrument(&dir), &device);

    queue.add_melody("C D E").unwrap();
    queue.play();
    eventually(|| device.outstanding() > 0, "first note never started");

    queue.stop();
    assert!(!queue.is_playing());
    assert!(queue.pending_notes().is_empty());
    eventually(|| !device.is_running(), "output never stopped");

    // The device still holds buffers from the stopped note; the next melody waits for them.
    queue.add_note("G").unwrap();
    queue.play();
    pump_until_idle(&queue, &device);

    let stats = queue.stats();
    assert_eq!(stats.sessions_started, 2);
    assert_eq!(stats.melodies_completed, 1);
}

#[test]
fn test_melodies_play_back_to_back() {
    let dir = tempfile::tempdir().unwrap();
    let device = mock::Device::get("mock");
    let queue = queue(&short_instrument(&dir), &device);

    queue.add_melody("C E G").unwrap();
    queue.play();
    assert!(queue.wait_until_idle_timeout(TIMEOUT));

    queue.add_melody("G E").unwrap();
    queue.play();
    assert!(queue.wait_until_idle_timeout(TIMEOUT));

    let stats = queue.stats();
    assert_eq!(stats.sessions_started, 5);
    assert_eq!(stats.melodies_completed, 2);
}

#[test]
fn test_playback_delay() {
    let dir = tempfile::tempdir().unwrap();
    let device = mock::Device::get("mock");
    let settings = PlaybackSettings {
        playback_delay: Duration::from_millis(100),
        ..Default::default()
    };
    let queue =
        MelodyQueue::with_instrument(short_instrument(&dir), Arc::new(device.clone()), settings)
            .unwrap();

    queue.add_note("C").unwrap();
    let start = Instant::now();
    queue.play();
    assert!(queue.wait_until_idle_timeout(TIMEOUT));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_setup_errors_are_returned() {
    let dir = tempfile::tempdir().unwrap();
    let device: Arc<dyn Device> = Arc::new(mock::Device::get("mock"));

    let missing = MelodyQueue::with_instrument(
        dir.path().join("missing.wav"),
        device.clone(),
        PlaybackSettings::default(),
    );
    assert!(matches!(missing, Err(Error::UnreadableFile { .. })));

    let garbage = dir.path().join("garbage.wav");
    std::fs::write(&garbage, b"not a wave file").unwrap();
    let unsupported = MelodyQueue::with_instrument(garbage, device, PlaybackSettings::default());
    assert!(matches!(unsupported, Err(Error::UnsupportedFormat { .. })));
}

#[test]
fn test_output_stops_outside_the_queue_lock() {
    let dir = tempfile::tempdir().unwrap();
    let inner = mock::Device::get("mock");
    let shared = Arc::new(Mutex::new(Weak::new()));
    let stops_while_locked = Arc::new(AtomicUsize::new(0));
    let device = LockWatchingDevice {
        inner: inner.clone(),
        shared: shared.clone(),
        stops_while_locked: stops_while_locked.clone(),
    };

    let queue = MelodyQueue::with_instrument(
        short_instrument(&dir),
        Arc::new(device),
        PlaybackSettings::default(),
    )
    .unwrap();
    *shared.lock() = Arc::downgrade(&queue.shared);

    queue.add_melody("C D").unwrap();
    queue.play();
    // Only the counters are read here, so the queue lock stays with the event loop.
    eventually(
        || queue.stats().melodies_completed == 1,
        "melody never finished",
    );

    assert!(inner.stats().stops >= 2);
    assert_eq!(stops_while_locked.load(Ordering::Acquire), 0);
}
