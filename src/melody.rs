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

//! Melody notation.
//!
//! A melody is a list of note tokens separated by whitespace or commas. Each token is a note
//! letter, an optional accidental (`#` or `b`), an optional octave digit (default 4) and an
//! optional length (`w`, `h`, `q`, `e`, `s`, `t`, optionally dotted; default quarter), so
//! `C`, `c#5`, `Bb3e` and `G2h.` are all notes.

use std::fmt;

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::error::Error;

#[derive(Parser)]
#[grammar = "src/melody/grammar.pest"]
struct MelodyParser;

/// MIDI note number of middle C (C4).
pub const MIDDLE_C: i32 = 60;

const DEFAULT_OCTAVE: i32 = 4;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A pitch as a MIDI note number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pitch {
    midi: i32,
}

impl Pitch {
    /// Creates a pitch from a MIDI note number.
    pub fn from_midi(midi: i32) -> Pitch {
        Pitch { midi }
    }

    pub fn midi(&self) -> i32 {
        self.midi
    }

    /// Semitones from `other` to this pitch.
    pub fn semitones_from(&self, other: Pitch) -> i32 {
        self.midi - other.midi
    }
}

impl fmt::Display for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octave = self.midi.div_euclid(12) - 1;
        let name = NOTE_NAMES[self.midi.rem_euclid(12) as usize];
        write!(f, "{}{}", name, octave)
    }
}

/// The length of a note as a fraction of a whole note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteLength {
    numerator: u32,
    denominator: u32,
}

impl NoteLength {
    pub const WHOLE: NoteLength = NoteLength::fraction(1, 1);
    pub const HALF: NoteLength = NoteLength::fraction(1, 2);
    pub const QUARTER: NoteLength = NoteLength::fraction(1, 4);
    pub const EIGHTH: NoteLength = NoteLength::fraction(1, 8);
    pub const SIXTEENTH: NoteLength = NoteLength::fraction(1, 16);
    pub const THIRTY_SECOND: NoteLength = NoteLength::fraction(1, 32);

    const fn fraction(numerator: u32, denominator: u32) -> NoteLength {
        NoteLength {
            numerator,
            denominator,
        }
    }

    /// This length extended by half.
    pub fn dotted(self) -> NoteLength {
        NoteLength::fraction(self.numerator * 3, self.denominator * 2)
    }

    /// The fraction of a whole note.
    pub fn as_fraction(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Duration in seconds when a quarter note lasts one beat at `bpm`.
    pub fn seconds(&self, bpm: f64) -> f64 {
        self.as_fraction() * 4.0 * 60.0 / bpm
    }
}

/// One note of a melody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Note {
    pub pitch: Pitch,
    pub length: NoteLength,
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.pitch, self.length.numerator, self.length.denominator)
    }
}

/// Parses a single note token.
pub fn parse_note(token: &str) -> Result<Note, Error> {
    parse_token(token, 1)
}

/// Parses a whole melody. Either every token parses or the first malformed one is reported.
pub fn parse_melody(text: &str) -> Result<Vec<Note>, Error> {
    tokens(text)
        .map(|(column, token)| parse_token(token, column))
        .collect()
}

/// Playback rate multiplier for a pitch `offset` semitones away from the instrument's pitch.
pub fn pitch_ratio(offset: i32) -> f64 {
    if offset == 0 {
        return 1.0;
    }
    2f64.powf(offset as f64 / 12.0)
}

/// Splits a melody into tokens with their 1-based character columns.
fn tokens(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut start: Option<(usize, usize)> = None;
    let mut boundaries = Vec::new();
    let mut column = 0;
    for (index, c) in text.char_indices() {
        column += 1;
        let separator = c.is_whitespace() || c == ',';
        match (separator, start) {
            (false, None) => start = Some((column, index)),
            (true, Some((token_column, token_start))) => {
                boundaries.push((token_column, &text[token_start..index]));
                start = None;
            }
            _ => {}
        }
    }
    if let Some((token_column, token_start)) = start {
        boundaries.push((token_column, &text[token_start..]));
    }
    boundaries.into_iter()
}

fn parse_token(token: &str, column: usize) -> Result<Note, Error> {
    let malformed = || Error::MalformedNote {
        token: token.to_string(),
        column,
    };

    let single = MelodyParser::parse(Rule::single, token)
        .map_err(|_| malformed())?
        .next()
        .ok_or_else(malformed)?;
    let note = single
        .into_inner()
        .find(|pair| pair.as_rule() == Rule::note)
        .ok_or_else(malformed)?;

    let note = note_from_pair(note).ok_or_else(malformed)?;
    // MIDI notes only.
    if !(0..=127).contains(&note.pitch.midi) {
        return Err(malformed());
    }
    Ok(note)
}

fn note_from_pair(pair: Pair<Rule>) -> Option<Note> {
    let mut semitone = None;
    let mut accidental = 0;
    let mut octave = DEFAULT_OCTAVE;
    let mut length = NoteLength::QUARTER;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::letter => {
                semitone = Some(match part.as_str().to_ascii_uppercase().as_str() {
                    "C" => 0,
                    "D" => 2,
                    "E" => 4,
                    "F" => 5,
                    "G" => 7,
                    "A" => 9,
                    "B" => 11,
                    _ => return None,
                });
            }
            Rule::accidental => {
                accidental = match part.into_inner().next()?.as_rule() {
                    Rule::sharp => 1,
                    Rule::flat => -1,
                    _ => return None,
                };
            }
            Rule::octave => octave = part.as_str().parse().ok()?,
            Rule::length => length = length_from_pair(part)?,
            _ => {}
        }
    }

    Some(Note {
        pitch: Pitch::from_midi((octave + 1) * 12 + semitone? + accidental),
        length,
    })
}

fn length_from_pair(pair: Pair<Rule>) -> Option<NoteLength> {
    let mut length = None;
    let mut dotted = false;
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::length_letter => {
                length = Some(match part.as_str() {
                    "w" => NoteLength::WHOLE,
                    "h" => NoteLength::HALF,
                    "q" => NoteLength::QUARTER,
                    "e" => NoteLength::EIGHTH,
                    "s" => NoteLength::SIXTEENTH,
                    "t" => NoteLength::THIRTY_SECOND,
                    _ => return None,
                })
            }
            Rule::dot => dotted = true,
            _ => {}
        }
    }
    length.map(|length| if dotted { length.dotted() } else { length })
}
