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
use std::path::{Path, PathBuf};

use config::{Config, File};
use serde::Deserialize;

use super::audio::Audio;
use super::error::ConfigError;
use crate::audio::buffer::DEFAULT_BUFFER_SECONDS;
use crate::engine::{PlaybackSettings, DEFAULT_TEMPO_BPM};
use crate::melody::{self, Pitch, MIDDLE_C};

/// The configuration for the melody player.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Player {
    /// The audio configuration.
    #[serde(default)]
    audio: Audio,
    /// The instrument to play melodies with.
    #[serde(default)]
    instrument: Instrument,
    /// How melodies are played.
    #[serde(default)]
    melody: Melody,
}

/// The instrument sample and the pitch it was recorded at.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Instrument {
    /// Path to the instrument file.
    file: Option<PathBuf>,
    /// The recorded pitch as a note, e.g. "A4". Middle C if unset.
    pitch: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Melody {
    /// Quarter notes per minute.
    tempo: Option<f64>,
    /// Seconds of audio per buffer.
    buffer_seconds: Option<f64>,
}

impl Player {
    /// Parse a player configuration from a YAML file.
    pub fn deserialize(path: &Path) -> Result<Player, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<Player>()?)
    }

    pub fn audio(&self) -> &Audio {
        &self.audio
    }

    /// The instrument file, if configured. Relative paths are as written.
    pub fn instrument_file(&self) -> Option<&Path> {
        self.instrument.file.as_deref()
    }

    /// The pitch the instrument was recorded at.
    pub fn native_pitch(&self) -> Result<Pitch, ConfigError> {
        match &self.instrument.pitch {
            Some(pitch) => parse_pitch(pitch),
            None => Ok(Pitch::from_midi(MIDDLE_C)),
        }
    }

    /// Quarter notes per minute.
    pub fn tempo(&self) -> Result<f64, ConfigError> {
        positive("tempo", self.melody.tempo.unwrap_or(DEFAULT_TEMPO_BPM))
    }

    /// Seconds of audio per buffer.
    pub fn buffer_seconds(&self) -> Result<f64, ConfigError> {
        positive(
            "buffer_seconds",
            self.melody.buffer_seconds.unwrap_or(DEFAULT_BUFFER_SECONDS),
        )
    }

    /// Everything the playback engine needs from this configuration.
    pub fn playback_settings(&self) -> Result<PlaybackSettings, ConfigError> {
        Ok(PlaybackSettings {
            native_pitch: self.native_pitch()?,
            tempo_bpm: self.tempo()?,
            buffer_seconds: self.buffer_seconds()?,
            playback_delay: self.audio.playback_delay()?,
        })
    }
}

/// Parses a pitch written as a note token. Any length suffix is ignored.
pub fn parse_pitch(value: &str) -> Result<Pitch, ConfigError> {
    melody::parse_note(value)
        .map(|note| note.pitch)
        .map_err(|e| ConfigError::InvalidPitch {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue { name, value })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use config::{Config, File, FileFormat};

    use super::*;

    fn from_yaml(yaml: &str) -> Player {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_player_deserialize() {
        let player = from_yaml(
            r#"
            audio:
              device: mock-device
              sample_rate: 48000
              playback_delay: 250ms
            instrument:
              file: samples/piano.wav
              pitch: A4
            melody:
              tempo: 90
              buffer_seconds: 0.25
            "#,
        );

        assert_eq!(player.audio().device(), "mock-device");
        assert_eq!(player.audio().sample_rate(), Some(48000));
        assert_eq!(
            player.instrument_file(),
            Some(Path::new("samples/piano.wav"))
        );

        let settings = player.playback_settings().unwrap();
        assert_eq!(settings.native_pitch, Pitch::from_midi(69));
        assert_eq!(settings.tempo_bpm, 90.0);
        assert_eq!(settings.buffer_seconds, 0.25);
        assert_eq!(settings.playback_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_player_defaults() {
        let player = from_yaml("instrument:\n  file: bell.aiff\n");

        assert_eq!(player.audio().device(), "default");
        assert_eq!(player.audio().sample_rate(), None);
        assert_eq!(
            player.playback_settings().unwrap(),
            PlaybackSettings::default()
        );
        assert_eq!(player.instrument_file(), Some(Path::new("bell.aiff")));
        assert!(Player::default().instrument_file().is_none());
    }

    #[test]
    fn test_player_invalid_values() {
        let player = from_yaml("instrument:\n  pitch: H2\n");
        assert!(matches!(
            player.native_pitch(),
            Err(ConfigError::InvalidPitch { .. })
        ));

        let player = from_yaml("melody:\n  tempo: 0\n");
        assert!(matches!(
            player.tempo(),
            Err(ConfigError::InvalidValue { name: "tempo", .. })
        ));

        let player = from_yaml("audio:\n  playback_delay: soon\n");
        assert!(matches!(
            player.audio().playback_delay(),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_player_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.yaml");
        std::fs::write(
            &path,
            "audio:\n  device: mock\ninstrument:\n  file: tone.wav\n  pitch: G3\n",
        )
        .unwrap();

        let player = Player::deserialize(&path).unwrap();
        assert_eq!(player.audio().device(), "mock");
        assert_eq!(player.native_pitch().unwrap(), Pitch::from_midi(55));

        let missing = Player::deserialize(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::Load(_))));
    }
}
