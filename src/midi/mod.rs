//! MIDI file parsing: binary decoding and the track ingestion pipeline.

use std::time::Duration;

pub mod cursor;
pub mod parser;
pub mod pipeline;

pub use pipeline::MidiFile;

/// Standard MIDI file format, from the header's format word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiFormat {
    SingleTrack,
    MultiSyncTracks,
    /// Parsed but treated as synchronous; sequential playback semantics are
    /// not implemented.
    MultiAsyncTracks,
}

#[derive(Debug, Clone, Copy)]
pub struct MidiHeader {
    pub format: MidiFormat,
    pub track_count: u16,
    /// Ticks per quarter note.
    pub division: u16,
}

/// Byte range of one track's body within the source stream.
#[derive(Debug, Clone, Copy)]
pub struct TrackHeader {
    pub index: u16,
    pub size: u32,
    pub offset: usize,
}

/// A tempo change at an absolute tick.
#[derive(Debug, Clone, Copy)]
pub struct TempoEvent {
    pub tick: u64,
    /// Microseconds per quarter note.
    pub value: u32,
    pub bpm: f64,
}

impl TempoEvent {
    pub fn new(tick: u64, value: u32) -> Self {
        Self {
            tick,
            value,
            bpm: 60_000_000.0 / f64::from(value),
        }
    }
}

/// One visualized note. Created by a note-on with nonzero velocity; `end` is
/// filled by the matching note-off, or at end-of-track for notes left open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderNote {
    pub pitch: u8,
    pub track: u16,
    pub start: u64,
    pub end: u64,
}

pub const DEFAULT_TEMPO: u32 = 500_000;

/// Convert an absolute tick to wall-clock time through the piecewise-linear
/// tempo map. `tempos` must be sorted by tick.
pub fn ticks_to_time(tick: u64, division: u16, tempos: &[TempoEvent]) -> Duration {
    let division = u128::from(division.max(1));
    let mut micros = 0u128;
    let mut last_tick = 0u64;
    let mut tempo = u128::from(DEFAULT_TEMPO);
    for t in tempos {
        if t.tick > tick {
            break;
        }
        micros += u128::from(t.tick - last_tick) * tempo / division;
        last_tick = t.tick;
        tempo = u128::from(t.value);
    }
    micros += u128::from(tick - last_tick) * tempo / division;
    Duration::from_micros(micros as u64)
}
