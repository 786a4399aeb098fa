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
use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::audio::{AudioBuffer as DecodedBuffer, AudioBufferRef, Layout, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, info, warn};

use super::buffer::AudioBuffer;
use crate::error::Error;

/// The native stream description of an instrument file.
#[derive(Debug, Clone)]
pub struct StreamDescription {
    /// Nominal sample rate in Hz.
    pub sample_rate: u32,
    /// Codec short name, e.g. "pcm_s16le" or "mp3".
    pub format: String,
    pub channels: u16,
    pub channel_layout: Option<Layout>,
    pub bits_per_sample: Option<u32>,
    /// Maximum frames per packet, if the container reports it.
    pub frames_per_packet: Option<u64>,
    /// True for linear PCM, where every packet is plain frames and packet
    /// descriptions carry no information.
    pub constant_frames: bool,
}

impl StreamDescription {
    /// Bytes per decoded frame (interleaved f32).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels.max(1) as usize * std::mem::size_of::<f32>()
    }

    /// Upper bound of a decoded packet in bytes, if known.
    pub fn max_bytes_per_packet(&self) -> Option<usize> {
        self.frames_per_packet
            .filter(|frames| *frames > 0)
            .map(|frames| frames as usize * self.bytes_per_frame())
    }
}

impl fmt::Display for StreamDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {}ch",
            self.format, self.sample_rate, self.channels
        )
    }
}

/// The result of a single read into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketRead {
    pub packets: usize,
    pub frames: u64,
}

/// Reads packets from the instrument file. The cursor is rewound for every note.
pub struct InstrumentSource {
    path: PathBuf,
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    description: StreamDescription,
    /// Packets handed out since the last reset.
    current_packet: u64,
    /// Decoded samples not yet copied into a buffer.
    pending: Vec<f32>,
    exhausted: bool,
}

impl InstrumentSource {
    /// Opens the given file and reads its stream description.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<InstrumentSource, Error> {
        let path = path.as_ref().to_path_buf();
        let (format_reader, decoder, track_id, description) = Self::open_stream(&path)?;

        info!(
            path = ?path,
            format = description.format,
            sample_rate = description.sample_rate,
            channels = description.channels,
            frames_per_packet = ?description.frames_per_packet,
            "Opened instrument"
        );

        Ok(InstrumentSource {
            path,
            format_reader,
            decoder,
            track_id,
            description,
            current_packet: 0,
            pending: Vec::new(),
            exhausted: false,
        })
    }

    fn open_stream(
        path: &Path,
    ) -> Result<(Box<dyn FormatReader>, Box<dyn Decoder>, u32, StreamDescription), Error> {
        let file = File::open(path).map_err(|source| Error::UnreadableFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let unsupported = |reason: String| Error::UnsupportedFormat {
            path: path.to_path_buf(),
            reason,
        };

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = Default::default();
        let probed = get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|e| match e {
                SymphoniaError::IoError(source)
                    if source.kind() != std::io::ErrorKind::UnexpectedEof =>
                {
                    Error::UnreadableFile {
                        path: path.to_path_buf(),
                        source,
                    }
                }
                e => unsupported(e.to_string()),
            })?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| unsupported("no audio track found".to_string()))?;
        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| unsupported("sample rate not specified".to_string()))?;
        let channels = params
            .channels
            .map(|channels| channels.count() as u16)
            .filter(|count| *count > 0)
            .ok_or_else(|| unsupported("channels not specified".to_string()))?;

        let format = get_codecs()
            .get_codec(params.codec)
            .map(|descriptor| descriptor.short_name.to_string())
            .unwrap_or_else(|| params.codec.to_string());
        let constant_frames = format.starts_with("pcm_");

        let decoder = get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| unsupported(e.to_string()))?;

        let description = StreamDescription {
            sample_rate,
            format,
            channels,
            channel_layout: params.channel_layout,
            bits_per_sample: params.bits_per_sample,
            frames_per_packet: params.max_frames_per_packet,
            constant_frames,
        };

        Ok((format_reader, decoder, track_id, description))
    }

    pub fn description(&self) -> &StreamDescription {
        &self.description
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The packet cursor, counted in packets handed out since the last reset.
    pub fn current_packet(&self) -> u64 {
        self.current_packet
    }

    /// Rewinds to the first packet.
    pub fn reset_cursor(&mut self) -> Result<(), Error> {
        self.pending.clear();
        self.current_packet = 0;
        self.exhausted = false;

        let seek_to = SeekTo::TimeStamp {
            ts: 0,
            track_id: self.track_id,
        };
        match self.format_reader.seek(SeekMode::Accurate, seek_to) {
            Ok(_) => {
                self.decoder.reset();
                Ok(())
            }
            Err(e) => {
                debug!(err = %e, path = ?self.path, "Seek unsupported, reopening instrument");
                let (format_reader, decoder, track_id, _) = Self::open_stream(&self.path)?;
                self.format_reader = format_reader;
                self.decoder = decoder;
                self.track_id = track_id;
                Ok(())
            }
        }
    }

    /// Reads up to `max_packets` packets into the buffer, bounded by the buffer's capacity and
    /// by `max_frames` if given. Returns fewer packets, possibly none, at the end of the stream.
    pub fn read_packets(
        &mut self,
        buffer: &mut AudioBuffer,
        max_packets: usize,
        max_frames: Option<u64>,
    ) -> Result<PacketRead, Error> {
        buffer.clear();

        let channels = self.description.channels as usize;
        let capacity_frames = buffer.capacity_frames();
        let budget = max_frames.map_or(usize::MAX, |frames| {
            usize::try_from(frames).unwrap_or(usize::MAX)
        });
        let mut read = PacketRead::default();
        let mut frames = 0usize;

        while read.packets < max_packets && frames < capacity_frames && frames < budget {
            if self.pending.is_empty() {
                match self.decode_next()? {
                    Some(samples) => self.pending = samples,
                    None => break,
                }
            }

            let pending_frames = self.pending.len() / channels;
            let capacity_room = capacity_frames - frames;
            // Keep whole packets together unless one can never fit.
            if pending_frames > capacity_room && frames > 0 {
                break;
            }

            let take = pending_frames.min(capacity_room).min(budget - frames);
            buffer.push_packet(&self.pending[..take * channels]);
            self.pending.drain(..take * channels);

            frames += take;
            read.packets += 1;
            self.current_packet += 1;
        }

        read.frames = frames as u64;
        Ok(read)
    }

    /// Decodes the next packet of our track into interleaved f32 samples. None at the end.
    fn decode_next(&mut self) -> Result<Option<Vec<f32>>, Error> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            let packet = match self.next_packet()? {
                Some(packet) => packet,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    self.decoder.decode(&packet)?
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Corrupt packets are skipped rather than ending the note.
                    warn!(err = e, path = ?self.path, "Skipping undecodable packet");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let samples = decode_buffer_to_f32(decoded, self.description.channels as usize);
            // Header packets can decode to nothing.
            if !samples.is_empty() {
                return Ok(Some(samples));
            }
        }
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            match self.format_reader.next_packet() {
                Ok(packet) => return Ok(Some(packet)),
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None)
                }
                // Some readers report the end of the stream as a decode error.
                Err(SymphoniaError::DecodeError(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Converts a decoded buffer to interleaved f32, remapped to the stream's channel count.
fn decode_buffer_to_f32(decoded: AudioBufferRef, channels: usize) -> Vec<f32> {
    match decoded {
        AudioBufferRef::F32(buf) => interleave(&buf, channels, |sample| sample),
        AudioBufferRef::F64(buf) => interleave(&buf, channels, |sample| sample as f32),
        AudioBufferRef::S8(buf) => interleave(&buf, channels, |sample| {
            sample as f32 / (1i64 << 7) as f32
        }),
        AudioBufferRef::S16(buf) => interleave(&buf, channels, |sample| {
            sample as f32 / (1i64 << 15) as f32
        }),
        AudioBufferRef::S24(buf) => interleave(&buf, channels, |sample| {
            sample.inner() as f32 / (1i64 << 23) as f32
        }),
        AudioBufferRef::S32(buf) => interleave(&buf, channels, |sample| {
            sample as f32 / (1i64 << 31) as f32
        }),
        AudioBufferRef::U8(buf) => interleave(&buf, channels, |sample| {
            (sample as f32 / u8::MAX as f32) * 2.0 - 1.0
        }),
        AudioBufferRef::U16(buf) => interleave(&buf, channels, |sample| {
            (sample as f32 / u16::MAX as f32) * 2.0 - 1.0
        }),
        AudioBufferRef::U24(buf) => interleave(&buf, channels, |sample| {
            (sample.inner() as f32 / ((1u32 << 24) - 1) as f32) * 2.0 - 1.0
        }),
        AudioBufferRef::U32(buf) => interleave(&buf, channels, |sample| {
            (sample as f32 / u32::MAX as f32) * 2.0 - 1.0
        }),
    }
}

/// Interleaves planar samples. Missing channels repeat the last decoded channel.
fn interleave<T, F>(buf: &DecodedBuffer<T>, channels: usize, convert: F) -> Vec<f32>
where
    T: symphonia::core::sample::Sample,
    F: Fn(T) -> f32,
{
    let frames = buf.frames();
    let decoded_channels = buf.spec().channels.count();
    if decoded_channels == 0 {
        return Vec::new();
    }

    let planes = buf.planes();
    let planes = planes.planes();
    let mut samples = Vec::with_capacity(frames * channels);
    for frame in 0..frames {
        for channel in 0..channels {
            let plane = channel.min(decoded_channels - 1);
            samples.push(convert(planes[plane][frame]));
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{BufferSizing, BUFFER_COUNT};
    use crate::testutil::write_sine_wav;

    #[test]
    fn test_open_describes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine_wav(&path, 1, 44100, 4410).unwrap();

        let source = InstrumentSource::open(&path).unwrap();
        let description = source.description();
        assert_eq!(description.sample_rate, 44100);
        assert_eq!(description.channels, 1);
        assert_eq!(description.format, "pcm_s16le");
        assert!(description.constant_frames);
        assert_eq!(description.bytes_per_frame(), 4);
        assert_eq!(source.path(), path.as_path());
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let result = InstrumentSource::open(dir.path().join("missing.wav"));
        assert!(matches!(result, Err(Error::UnreadableFile { .. })));
    }

    #[test]
    fn test_garbage_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.bin");
        std::fs::write(&path, b"this is not an audio file at all").unwrap();

        let result = InstrumentSource::open(&path);
        assert!(matches!(result, Err(Error::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_reads_respect_capacity_and_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine_wav(&path, 2, 22050, 3000).unwrap();

        let mut source = InstrumentSource::open(&path).unwrap();
        let mut buffer = AudioBuffer::allocate(0, 1024 * 8, 2, None).unwrap();
        let packets = BufferSizing::derive(source.description(), 0.5).packets_per_buffer;
        assert!(packets >= 1);

        let mut total = 0u64;
        let mut reads = 0;
        loop {
            let read = source.read_packets(&mut buffer, packets, None).unwrap();
            assert!(buffer.byte_len() <= buffer.capacity_bytes());
            assert_eq!(buffer.frames() as u64, read.frames);
            if read.packets == 0 {
                assert!(buffer.is_empty());
                break;
            }
            total += read.frames;
            reads += 1;
            assert!(reads < 100, "reader never reached the end of the stream");
        }
        assert_eq!(total, 3000);

        // Past the end is still not an error.
        let read = source.read_packets(&mut buffer, packets, None).unwrap();
        assert_eq!(read, PacketRead::default());
    }

    #[test]
    fn test_reset_cursor_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine_wav(&path, 1, 44100, 2000).unwrap();

        let mut source = InstrumentSource::open(&path).unwrap();
        let mut buffer = AudioBuffer::allocate(0, 512 * 4, 1, None).unwrap();

        let first = source.read_packets(&mut buffer, 64, None).unwrap();
        let first_samples = buffer.samples().to_vec();
        assert!(first.frames > 0);
        while source.read_packets(&mut buffer, 64, None).unwrap().packets > 0 {}
        assert!(source.current_packet() > 0);

        source.reset_cursor().unwrap();
        assert_eq!(source.current_packet(), 0);
        let again = source.read_packets(&mut buffer, 64, None).unwrap();
        assert_eq!(again, first);
        assert_eq!(buffer.samples(), first_samples.as_slice());
    }

    #[test]
    fn test_frame_budget_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine_wav(&path, 1, 44100, 4000).unwrap();

        let mut source = InstrumentSource::open(&path).unwrap();
        let mut buffer = AudioBuffer::allocate(0, 4096 * 4, 1, None).unwrap();
        let read = source.read_packets(&mut buffer, 1024, Some(100)).unwrap();
        assert_eq!(read.frames, 100);
        assert_eq!(buffer.frames(), 100);

        let read = source.read_packets(&mut buffer, 1024, Some(0)).unwrap();
        assert_eq!(read.packets, 0);
    }

    #[test]
    fn test_packet_descriptions_recorded_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine_wav(&path, 1, 44100, 2000).unwrap();

        let mut source = InstrumentSource::open(&path).unwrap();
        let mut buffer = AudioBuffer::allocate(0, 8192, 1, Some(BUFFER_COUNT * 64)).unwrap();
        let read = source.read_packets(&mut buffer, 64, None).unwrap();

        let packets = buffer.packet_descriptions().unwrap();
        assert_eq!(packets.len(), read.packets);
        let frames: u64 = packets.iter().map(|p| p.frames as u64).sum();
        assert_eq!(frames, read.frames);
    }
}
