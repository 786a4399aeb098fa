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
use clap::{crate_version, Args, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use melodyq::config::{self, Player};
use melodyq::engine::DEFAULT_TEMPO_BPM;
use melodyq::melody::{parse_melody, pitch_ratio, Pitch, MIDDLE_C};
use melodyq::{audio, MelodyQueue};

/// The melody appended on every stress test round.
const STRESS_TEST_MELODY: &str = "E5e D#5e E5e D#5e E5e B4e D5e C5e A4q.";

/// Time between stress test rounds.
const STRESS_TEST_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "Plays melodies with a single instrument sample."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Plays a melody through the audio interface.
    Play {
        /// The melody to play, e.g. "C D E F G2h".
        melody: String,
        #[command(flatten)]
        player: PlayerArgs,
    },
    /// Parses a melody and prints its notes.
    Verify {
        /// The melody to verify.
        melody: String,
        /// The pitch the instrument was recorded at, e.g. A4.
        #[arg(short, long)]
        pitch: Option<String>,
        /// Quarter notes per minute.
        #[arg(short, long)]
        tempo: Option<f64>,
    },
    /// Keeps appending a melody while it plays.
    StressTest {
        /// The number of times to append the melody.
        #[arg(short, long, default_value_t = 10)]
        rounds: usize,
        #[command(flatten)]
        player: PlayerArgs,
    },
}

/// Options shared by every command that plays audio.
#[derive(Args)]
struct PlayerArgs {
    /// The instrument file. Overrides the player config.
    #[arg(short, long)]
    instrument: Option<PathBuf>,
    /// The device name to play through. "default" picks the default output device.
    #[arg(short, long)]
    device: Option<String>,
    /// The pitch the instrument was recorded at, e.g. A4.
    #[arg(short, long)]
    pitch: Option<String>,
    /// Quarter notes per minute.
    #[arg(short, long)]
    tempo: Option<f64>,
    /// The path to the player config.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl PlayerArgs {
    /// Opens a melody queue from the player config with any overrides applied.
    fn open_queue(&self) -> Result<Arc<MelodyQueue>, Box<dyn Error>> {
        let player = match &self.config {
            Some(path) => Player::deserialize(path)?,
            None => Player::default(),
        };

        let mut settings = player.playback_settings()?;
        if let Some(pitch) = &self.pitch {
            settings.native_pitch = config::parse_pitch(pitch)?;
        }
        if let Some(tempo) = self.tempo {
            settings.tempo_bpm = positive_tempo(tempo)?;
        }

        let audio = match &self.device {
            Some(device) => player.audio().with_device(device),
            None => player.audio().clone(),
        };
        let instrument = self
            .instrument
            .clone()
            .or_else(|| player.instrument_file().map(PathBuf::from))
            .ok_or("no instrument file given, use --instrument or a player config")?;

        let device = audio::get_device(&audio)?;
        info!(device = %device, instrument = ?instrument, "Opening melody queue");
        Ok(Arc::new(MelodyQueue::with_instrument(
            &instrument,
            device,
            settings,
        )?))
    }
}

fn positive_tempo(tempo: f64) -> Result<f64, Box<dyn Error>> {
    if tempo.is_finite() && tempo > 0.0 {
        Ok(tempo)
    } else {
        Err(format!("tempo must be positive, got {}", tempo).into())
    }
}

/// Waits for the queue to go idle without blocking the runtime.
async fn wait_until_idle(queue: &Arc<MelodyQueue>) -> Result<(), Box<dyn Error>> {
    let queue = queue.clone();
    tokio::task::spawn_blocking(move || queue.wait_until_idle()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Play { melody, player } => {
            let queue = player.open_queue()?;
            let count = queue.add_melody(&melody)?;
            if count == 0 {
                println!("Nothing to play.");
                return Ok(());
            }

            queue.play();
            wait_until_idle(&queue).await?;
            println!("Played {} notes.", queue.stats().sessions_started);
        }
        Commands::Verify {
            melody,
            pitch,
            tempo,
        } => {
            let native_pitch = match pitch {
                Some(pitch) => config::parse_pitch(&pitch)?,
                None => Pitch::from_midi(MIDDLE_C),
            };
            let tempo = positive_tempo(tempo.unwrap_or(DEFAULT_TEMPO_BPM))?;

            let notes = parse_melody(&melody)?;
            println!("Notes (count: {}):", notes.len());
            for note in notes {
                println!(
                    "- {} for {:.3}s (rate x{:.4})",
                    note.pitch,
                    note.length.seconds(tempo),
                    pitch_ratio(note.pitch.semitones_from(native_pitch))
                );
            }
        }
        Commands::StressTest { rounds, player } => {
            let queue = player.open_queue()?;

            for round in 0..rounds {
                let count = queue.add_melody(STRESS_TEST_MELODY)?;
                queue.play();
                info!(
                    round,
                    added = count,
                    pending = queue.pending_notes().len(),
                    "Appended melody"
                );
                tokio::time::sleep(STRESS_TEST_INTERVAL).await;
            }

            wait_until_idle(&queue).await?;
            let stats = queue.stats();
            println!(
                "Played {} notes in {} melodies.",
                stats.sessions_started, stats.melodies_completed
            );
        }
    }

    Ok(())
}
