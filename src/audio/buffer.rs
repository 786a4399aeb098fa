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

//! Fixed pool of audio buffers shared between the playback engine and the output device.
//!
//! Each slot is free, filled or submitted. While a buffer is submitted the device owns it
//! outright; it comes back through the drained channel and is released to its slot.

use std::fmt;
use std::mem;

use tracing::debug;

use super::source::StreamDescription;
use crate::error::Error;

/// Number of buffers in the pool.
pub const BUFFER_COUNT: usize = 3;

/// Seconds of audio each buffer should hold when the packet size is known.
pub const DEFAULT_BUFFER_SECONDS: f64 = 0.5;

/// Largest buffer the sizing heuristic will produce, unless a single packet is larger.
const MAX_BUFFER_BYTES: usize = 0x50000;

/// Smallest buffer, also used when the packet size is not known in advance.
const MIN_BUFFER_BYTES: usize = 0x4000;

const BYTES_PER_SAMPLE: usize = mem::size_of::<f32>();

/// Describes one packet stored in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescription {
    /// Offset of the packet within the buffer, in bytes.
    pub start_offset: usize,
    /// Number of frames in the packet.
    pub frames: u32,
    /// Size of the packet data in bytes.
    pub data_byte_size: u32,
}

/// A fixed-capacity buffer of interleaved f32 samples.
pub struct AudioBuffer {
    /// The pool slot this buffer belongs to.
    slot: usize,
    /// The session generation this buffer was last submitted under.
    generation: u64,
    capacity_bytes: usize,
    channels: u16,
    samples: Vec<f32>,
    /// Packet descriptions for the filled region. None for constant frame formats.
    packets: Option<Vec<PacketDescription>>,
}

impl AudioBuffer {
    /// Allocates a buffer up front. Allocation failure is reported rather than aborting.
    pub fn allocate(
        slot: usize,
        capacity_bytes: usize,
        channels: u16,
        max_packets: Option<usize>,
    ) -> Result<AudioBuffer, Error> {
        let frame_bytes = channels.max(1) as usize * BYTES_PER_SAMPLE;
        // Whole frames only.
        let capacity_bytes = (capacity_bytes / frame_bytes).max(1) * frame_bytes;

        let mut samples: Vec<f32> = Vec::new();
        samples
            .try_reserve_exact(capacity_bytes / BYTES_PER_SAMPLE)
            .map_err(|_| Error::BufferAllocationFailure {
                bytes: capacity_bytes,
            })?;

        let packets = match max_packets {
            Some(max_packets) => {
                let mut packets = Vec::new();
                packets
                    .try_reserve_exact(max_packets)
                    .map_err(|_| Error::BufferAllocationFailure {
                        bytes: max_packets
                            .saturating_mul(mem::size_of::<PacketDescription>()),
                    })?;
                Some(packets)
            }
            None => None,
        };

        Ok(AudioBuffer {
            slot,
            generation: 0,
            capacity_bytes,
            channels: channels.max(1),
            samples,
            packets,
        })
    }

    /// The pool slot this buffer belongs to.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The session generation this buffer was submitted under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// The capacity of this buffer in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_bytes / (self.channels as usize * BYTES_PER_SAMPLE)
    }

    /// The number of filled bytes.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * BYTES_PER_SAMPLE
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// The number of filled frames.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The filled samples, interleaved.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Returns the sample at the given frame and channel, or silence past the end.
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        self.samples
            .get(frame * self.channels as usize + channel)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn packet_descriptions(&self) -> Option<&[PacketDescription]> {
        self.packets.as_deref()
    }

    /// Empties the buffer without giving up its allocation.
    pub(crate) fn clear(&mut self) {
        self.samples.clear();
        if let Some(packets) = self.packets.as_mut() {
            packets.clear();
        }
    }

    /// Appends one packet of interleaved samples. The caller guarantees it fits.
    pub(crate) fn push_packet(&mut self, samples: &[f32]) {
        debug_assert!(self.byte_len() + samples.len() * BYTES_PER_SAMPLE <= self.capacity_bytes);

        let start_offset = self.byte_len();
        self.samples.extend_from_slice(samples);
        if let Some(packets) = self.packets.as_mut() {
            packets.push(PacketDescription {
                start_offset,
                frames: (samples.len() / self.channels as usize) as u32,
                data_byte_size: (samples.len() * BYTES_PER_SAMPLE) as u32,
            });
        }
    }

    fn stamp(&mut self, generation: u64) {
        self.generation = generation;
    }
}

impl fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("capacity_bytes", &self.capacity_bytes)
            .field("byte_len", &self.byte_len())
            .finish()
    }
}

/// Buffer capacity and packets per read, derived once from the stream description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizing {
    pub capacity_bytes: usize,
    pub packets_per_buffer: usize,
}

impl BufferSizing {
    /// Sizes buffers to hold roughly `seconds` of audio. Falls back to a fixed capacity when
    /// the format can't say how large its packets are.
    pub fn derive(description: &StreamDescription, seconds: f64) -> BufferSizing {
        let max_packet_bytes = description.max_bytes_per_packet();

        let capacity_bytes = match (description.frames_per_packet, max_packet_bytes) {
            (Some(frames_per_packet), Some(max_packet_bytes)) if frames_per_packet > 0 => {
                let packets_for_time =
                    description.sample_rate as f64 / frames_per_packet as f64 * seconds;
                let size = (packets_for_time * max_packet_bytes as f64) as usize;
                let size = if size > MAX_BUFFER_BYTES && size > max_packet_bytes {
                    MAX_BUFFER_BYTES
                } else if size < MIN_BUFFER_BYTES {
                    MIN_BUFFER_BYTES
                } else {
                    size
                };
                // At least one whole packet must fit.
                size.max(max_packet_bytes)
            }
            _ => MIN_BUFFER_BYTES,
        };

        let packet_bytes = max_packet_bytes.unwrap_or_else(|| description.bytes_per_frame());
        BufferSizing {
            capacity_bytes,
            packets_per_buffer: (capacity_bytes / packet_bytes.max(1)).max(1),
        }
    }
}

/// The state of one pool slot.
enum Slot {
    Free(AudioBuffer),
    Filled(AudioBuffer),
    Submitted { generation: u64 },
}

/// Per-state counts of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub free: usize,
    pub filled: usize,
    pub submitted: usize,
}

impl Occupancy {
    pub fn total(&self) -> usize {
        self.free + self.filled + self.submitted
    }
}

/// The fixed pool of buffers.
pub struct BufferPool {
    slots: Vec<Slot>,
}

impl BufferPool {
    /// Allocates `count` buffers of the given capacity.
    pub fn allocate(
        count: usize,
        capacity_bytes: usize,
        channels: u16,
        max_packets: Option<usize>,
    ) -> Result<BufferPool, Error> {
        let slots = (0..count)
            .map(|slot| {
                AudioBuffer::allocate(slot, capacity_bytes, channels, max_packets).map(Slot::Free)
            })
            .collect::<Result<Vec<Slot>, Error>>()?;

        debug!(
            buffers = count,
            capacity_bytes, "Allocated audio buffer pool"
        );
        Ok(BufferPool { slots })
    }

    /// Indices of the free slots, in slot order.
    pub fn free_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| matches!(slot, Slot::Free(_)).then_some(index))
            .collect()
    }

    /// Mutable access to a buffer the engine currently holds (free or filled).
    pub fn buffer_mut(&mut self, slot: usize) -> Option<&mut AudioBuffer> {
        match self.slots.get_mut(slot)? {
            Slot::Free(buffer) | Slot::Filled(buffer) => Some(buffer),
            Slot::Submitted { .. } => None,
        }
    }

    /// Free -> Filled. Returns false if the slot wasn't free.
    pub fn mark_filled(&mut self, slot: usize) -> bool {
        self.transition(slot, |state| match state {
            Slot::Free(buffer) => Ok(Slot::Filled(buffer)),
            other => Err(other),
        })
    }

    /// Filled -> Submitted. Hands the buffer out stamped with the session generation.
    pub fn submit(&mut self, slot: usize, generation: u64) -> Option<AudioBuffer> {
        let state = self.slots.get_mut(slot)?;
        match mem::replace(state, Slot::Submitted { generation }) {
            Slot::Filled(mut buffer) => {
                buffer.stamp(generation);
                Some(buffer)
            }
            other => {
                *state = other;
                None
            }
        }
    }

    /// Submitted -> Free. Returns the generation the slot was submitted under, or hands the
    /// buffer back if its slot isn't waiting for it.
    pub fn release(&mut self, mut buffer: AudioBuffer) -> Result<u64, AudioBuffer> {
        let generation = match self.slots.get(buffer.slot()) {
            Some(Slot::Submitted { generation }) if *generation == buffer.generation() => {
                *generation
            }
            _ => return Err(buffer),
        };
        buffer.clear();
        let slot = buffer.slot();
        self.slots[slot] = Slot::Free(buffer);
        Ok(generation)
    }

    /// Current per-state counts.
    pub fn occupancy(&self) -> Occupancy {
        self.slots.iter().fold(
            Occupancy {
                free: 0,
                filled: 0,
                submitted: 0,
            },
            |mut occupancy, slot| {
                match slot {
                    Slot::Free(_) => occupancy.free += 1,
                    Slot::Filled(_) => occupancy.filled += 1,
                    Slot::Submitted { .. } => occupancy.submitted += 1,
                }
                occupancy
            },
        )
    }

    fn transition<F>(&mut self, slot: usize, f: F) -> bool
    where
        F: FnOnce(Slot) -> Result<Slot, Slot>,
    {
        if slot >= self.slots.len() {
            return false;
        }
        // Placeholder while the real state is moved through `f`.
        let state = mem::replace(&mut self.slots[slot], Slot::Submitted { generation: 0 });
        match f(state) {
            Ok(next) => {
                self.slots[slot] = next;
                true
            }
            Err(unchanged) => {
                self.slots[slot] = unchanged;
                false
            }
        }
    }
}
