use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::midi::parser::{self, ParsedTrack, TrackParser};
use crate::midi::{MidiHeader, RenderNote, TempoEvent};

/// Tracks larger than this are parsed on a worker thread; smaller tracks are
/// parsed inline on the enqueuing path.
pub const TRACK_LOAD_THRESHOLD: u32 = 80_000_000;

/// Soft cap on tracks waiting in the ingestion queue; the producer blocks
/// when it is reached.
pub const MAX_WAITING_TRACKS: usize = 1000;

/// A fully ingested MIDI file: header plus the merged global timelines.
#[derive(Debug)]
pub struct MidiFile {
    pub header: MidiHeader,
    /// Sorted ascending by start tick; ties resolve to track index
    /// ascending, then per-track decode order.
    pub notes: Vec<RenderNote>,
    /// Time-sorted tempo timeline; the last writer at a tick wins.
    pub tempos: Vec<TempoEvent>,
    pub note_count: u64,
    /// Maximum end-of-track tick across all tracks.
    pub max_tick: u64,
}

impl MidiFile {
    pub fn load(path: &Path, quiet: bool) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, quiet)
    }

    pub fn from_bytes(bytes: &[u8], quiet: bool) -> Result<Self> {
        let header = parser::parse_midi_header(bytes)?;
        let track_headers = parser::scan_track_headers(bytes, header.track_count)?;

        // slice every track body up front so the workers only ever see
        // valid ranges
        let mut bodies = Vec::with_capacity(track_headers.len());
        for th in &track_headers {
            let end = th
                .offset
                .checked_add(th.size as usize)
                .ok_or(Error::OutOfRange)?;
            let body = bytes.get(th.offset..end).ok_or(Error::OutOfRange)?;
            bodies.push(body);
        }

        let track_total = track_headers.len();
        let slots: Mutex<Vec<Option<Result<ParsedTrack>>>> =
            Mutex::new((0..track_total).map(|_| None).collect());
        let parsed_count = AtomicU64::new(0);
        let note_total = AtomicU64::new(0);

        let workers = thread::available_parallelism().map_or(1, |n| n.get());

        let finish = |index: u16, result: Result<ParsedTrack>| {
            let done = parsed_count.fetch_add(1, Ordering::Relaxed) + 1;
            if let Ok(parsed) = &result {
                let total = note_total.fetch_add(parsed.notes.len() as u64, Ordering::Relaxed)
                    + parsed.notes.len() as u64;
                if !quiet {
                    info!(track = index, parsed = done, of = track_total, notes = total, "parsed track");
                }
            }
            slots.lock()[usize::from(index)] = Some(result);
        };

        crossbeam::scope(|s| {
            let (tx, rx) = crossbeam::channel::bounded::<TrackParser>(MAX_WAITING_TRACKS);
            for _ in 0..workers {
                let rx = rx.clone();
                let finish = &finish;
                s.spawn(move |_| {
                    for track in rx.iter() {
                        let index = track.index();
                        finish(index, track.parse_all());
                    }
                });
            }
            drop(rx);

            for (th, body) in track_headers.iter().zip(&bodies) {
                let track = TrackParser::new(th.index, body);
                if th.size > TRACK_LOAD_THRESHOLD {
                    // send blocks once MAX_WAITING_TRACKS are pending,
                    // throttling the producer until the workers drain
                    if tx.send(track).is_err() {
                        break;
                    }
                } else {
                    finish(th.index, track.parse_all());
                }
            }
            drop(tx);
        })
        .expect("track ingestion worker panicked");

        Self::merge(header, slots.into_inner())
    }

    /// Single-threaded merge of the per-track results into one start-sorted
    /// note sequence and one tempo timeline.
    fn merge(header: MidiHeader, slots: Vec<Option<Result<ParsedTrack>>>) -> Result<Self> {
        let mut notes: Vec<RenderNote> = Vec::new();
        let mut tempo_map: BTreeMap<u64, TempoEvent> = BTreeMap::new();
        let mut max_tick = 0u64;

        for slot in slots {
            let track = slot.expect("every track parsed after scope join")?;
            max_tick = max_tick.max(track.end_tick);
            notes.extend(track.notes);
            for tempo in track.tempos {
                // later tracks overwrite at equal ticks
                tempo_map.insert(tempo.tick, tempo);
            }
        }

        // stable, so equal start ticks keep track order
        notes.sort_by_key(|n| n.start);
        let note_count = notes.len() as u64;

        Ok(Self {
            header,
            notes,
            tempos: tempo_map.into_values().collect(),
            note_count,
            max_tick,
        })
    }

    /// Start tick of the earliest note, or 0 when the file has none.
    pub fn first_note_start(&self) -> u64 {
        self.notes.first().map_or(0, |n| n.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(track_count: u16, division: u16) -> Vec<u8> {
        let mut bytes = b"MThd".to_vec();
        bytes.extend_from_slice(&6u32.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&track_count.to_be_bytes());
        bytes.extend_from_slice(&division.to_be_bytes());
        bytes
    }

    fn with_track(bytes: &mut Vec<u8>, body: &[u8]) {
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);
    }

    #[test]
    fn merges_tracks_into_a_start_sorted_sequence() {
        let mut bytes = header(2, 480);
        with_track(
            &mut bytes,
            &[
                0x81, 0x40, 0x90, 60, 100, // on at 192
                0x60, 0x80, 60, 0, // off at 288
                0x00, 0xFF, 0x2F, 0x00,
            ],
        );
        with_track(
            &mut bytes,
            &[
                0x00, 0x90, 72, 100, // on at 0
                0x81, 0x40, 0x80, 72, 0, // off at 192
                0x00, 0xFF, 0x2F, 0x00,
            ],
        );

        let file = MidiFile::from_bytes(&bytes, true).unwrap();
        assert_eq!(file.note_count, 2);
        assert_eq!(file.notes[0].pitch, 72);
        assert_eq!(file.notes[1].pitch, 60);
        for pair in file.notes.windows(2) {
            assert!(pair[0].start <= pair[1].start);
        }
        for n in &file.notes {
            assert!(n.end >= n.start);
        }
        assert_eq!(file.max_tick, 288);
        assert_eq!(file.first_note_start(), 0);
    }

    #[test]
    fn equal_start_ticks_keep_track_order() {
        let mut bytes = header(2, 480);
        for _ in 0..2 {
            with_track(
                &mut bytes,
                &[
                    0x00, 0x90, 60, 100,
                    0x60, 0x80, 60, 0,
                    0x00, 0xFF, 0x2F, 0x00,
                ],
            );
        }
        let file = MidiFile::from_bytes(&bytes, true).unwrap();
        assert_eq!(file.notes[0].track, 0);
        assert_eq!(file.notes[1].track, 1);
    }

    #[test]
    fn tempo_merge_prefers_the_later_track_at_equal_ticks() {
        let mut bytes = header(2, 480);
        with_track(
            &mut bytes,
            &[
                0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, // 500000 at 0
                0x00, 0xFF, 0x2F, 0x00,
            ],
        );
        with_track(
            &mut bytes,
            &[
                0x00, 0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40, // 1000000 at 0
                0x60, 0xFF, 0x51, 0x03, 0x03, 0xD0, 0x90, // 250000 at 96
                0x00, 0xFF, 0x2F, 0x00,
            ],
        );
        let file = MidiFile::from_bytes(&bytes, true).unwrap();
        assert_eq!(file.tempos.len(), 2);
        assert_eq!(file.tempos[0].tick, 0);
        assert_eq!(file.tempos[0].value, 1_000_000);
        assert_eq!(file.tempos[1].value, 250_000);
    }

    #[test]
    fn truncated_file_aborts_the_run() {
        let mut bytes = header(1, 480);
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&100u32.to_be_bytes()); // body missing
        assert!(MidiFile::from_bytes(&bytes, true).is_err());
    }

    #[test]
    fn empty_file_is_header_corrupted() {
        assert!(matches!(
            MidiFile::from_bytes(&[], true),
            Err(Error::OutOfRange) | Err(Error::HeaderCorrupted)
        ));
    }
}
