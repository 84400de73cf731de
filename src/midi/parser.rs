use crate::error::{Error, Result};
use crate::midi::cursor::ByteCursor;
use crate::midi::{MidiFormat, MidiHeader, RenderNote, TempoEvent, TrackHeader};

/// One open-note stack per (pitch, channel) pair.
const OPEN_NOTE_SLOTS: usize = 128 * 16;

/// Parse the file header: "MThd" magic, a length field that must equal 6,
/// format, track count and division.
pub fn parse_midi_header(bytes: &[u8]) -> Result<MidiHeader> {
    let mut cur = ByteCursor::new(bytes);
    for &c in b"MThd" {
        if cur.read()? != c {
            return Err(Error::HeaderCorrupted);
        }
    }
    if cur.read_u32_be()? != 6 {
        return Err(Error::HeaderCorrupted);
    }
    let format = match cur.read_u16_be()? {
        0 => MidiFormat::SingleTrack,
        1 => MidiFormat::MultiSyncTracks,
        2 => MidiFormat::MultiAsyncTracks,
        _ => return Err(Error::HeaderCorrupted),
    };
    let track_count = cur.read_u16_be()?;
    let division = cur.read_u16_be()?;
    // SMPTE timecode division carries no ticks-per-quarter base
    if division == 0 || division & 0x8000 != 0 {
        return Err(Error::HeaderCorrupted);
    }
    Ok(MidiHeader {
        format,
        track_count,
        division,
    })
}

/// Headers-only pre-scan: validate each "MTrk" tag, record the body's byte
/// range and seek past it without decoding any events.
pub fn scan_track_headers(bytes: &[u8], track_count: u16) -> Result<Vec<TrackHeader>> {
    let mut cur = ByteCursor::new(bytes);
    cur.skip(14);
    let mut headers = Vec::with_capacity(usize::from(track_count));
    for index in 0..track_count {
        for &c in b"MTrk" {
            if cur.read()? != c {
                return Err(Error::TrackHeaderCorrupted);
            }
        }
        let size = cur.read_u32_be()?;
        let offset = cur.position();
        cur.skip(size as usize);
        headers.push(TrackHeader { index, size, offset });
    }
    Ok(headers)
}

/// Per-track parse result, ready for the merge step.
#[derive(Debug)]
pub struct ParsedTrack {
    pub index: u16,
    /// Sorted by start tick (the track clock is monotonic).
    pub notes: Vec<RenderNote>,
    /// Sorted by tick; at most one event per tick (later events overwrite).
    pub tempos: Vec<TempoEvent>,
    /// Tick of the end-of-track event.
    pub end_tick: u64,
}

/// Decodes one track's event stream. Notes live in an index-addressed arena;
/// the open-note stacks hold indices into it, popped in LIFO order so that
/// overlapping same-key presses close last-opened-first.
pub struct TrackParser<'a> {
    index: u16,
    cursor: ByteCursor<'a>,
    clock: u64,
    running_status: u8,
    notes: Vec<RenderNote>,
    tempos: Vec<TempoEvent>,
    open: Vec<Vec<u32>>,
    parsed: bool,
}

impl<'a> TrackParser<'a> {
    pub fn new(index: u16, body: &'a [u8]) -> Self {
        Self {
            index,
            cursor: ByteCursor::new(body),
            clock: 0,
            running_status: 0,
            notes: Vec::new(),
            tempos: Vec::new(),
            open: vec![Vec::new(); OPEN_NOTE_SLOTS],
            parsed: false,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// Run the event loop to the end-of-track marker.
    pub fn parse_all(mut self) -> Result<ParsedTrack> {
        while !self.parsed {
            self.parse_event()?;
        }
        Ok(ParsedTrack {
            index: self.index,
            notes: self.notes,
            tempos: self.tempos,
            end_tick: self.clock,
        })
    }

    fn slot(key: u8, channel: u8) -> usize {
        usize::from(key & 0x7F) << 4 | usize::from(channel & 0x0F)
    }

    fn open_note(&mut self, key: u8, channel: u8) {
        let idx = self.notes.len() as u32;
        self.notes.push(RenderNote {
            pitch: key & 0x7F,
            track: self.index,
            start: self.clock,
            end: self.clock,
        });
        self.open[Self::slot(key, channel)].push(idx);
    }

    /// Close the most recently opened note for (key, channel); no-op when
    /// none is open.
    fn close_note(&mut self, key: u8, channel: u8) {
        if let Some(idx) = self.open[Self::slot(key, channel)].pop() {
            self.notes[idx as usize].end = self.clock;
        }
    }

    fn record_tempo(&mut self, value: u32) {
        let event = TempoEvent::new(self.clock, value);
        match self.tempos.last_mut() {
            Some(last) if last.tick == self.clock => *last = event,
            _ => self.tempos.push(event),
        }
    }

    /// Synthetic note-off for every still-open note, then mark the track
    /// fully parsed.
    fn end_track(&mut self) {
        for stack in &mut self.open {
            for idx in stack.drain(..) {
                self.notes[idx as usize].end = self.clock;
            }
        }
        self.parsed = true;
    }

    fn parse_event(&mut self) -> Result<()> {
        self.clock += u64::from(self.cursor.read_vlq()?);
        let mut status = self.cursor.read()?;
        if status < 0x80 {
            // running status: this was the first data byte of an event
            // reusing the previous status
            status = self.running_status;
            self.cursor.rewind_one();
        }
        self.running_status = status;

        let channel = status & 0x0F;
        match status & 0xF0 {
            0x80 => {
                let key = self.cursor.read()?;
                let _velocity = self.cursor.read()?;
                self.close_note(key, channel);
                return Ok(());
            }
            0x90 => {
                let key = self.cursor.read()?;
                let velocity = self.cursor.read()?;
                if velocity != 0 {
                    self.open_note(key, channel);
                } else {
                    self.close_note(key, channel);
                }
                return Ok(());
            }
            // aftertouch, control change, pitch wheel
            0xA0 | 0xB0 | 0xE0 => {
                self.cursor.skip(2);
                return Ok(());
            }
            // program change, channel pressure
            0xC0 | 0xD0 => {
                self.cursor.advance_if_not_last();
                return Ok(());
            }
            _ => {}
        }

        match status {
            0xF0 => {
                while self.cursor.read()? != 0xF7 {}
                Ok(())
            }
            0xF1 => Ok(()),
            0xF2 | 0xF3 => {
                self.cursor.skip(usize::from(0xF4 - status));
                Ok(())
            }
            // reserved / undefined system statuses carry no operand
            0xF4..=0xFE => Ok(()),
            0xFF => self.parse_meta(),
            _ => Err(Error::TrackCorrupted),
        }
    }

    fn parse_meta(&mut self) -> Result<()> {
        let meta = self.cursor.read()?;
        if (0x01..=0x09).contains(&meta) {
            // text events
            let len = self.cursor.read_vlq()?;
            self.cursor.skip(len as usize);
            return Ok(());
        }
        match meta {
            0x00 => {
                self.cursor.assert_byte(2)?;
                self.cursor.skip(2);
            }
            0x0A => {
                // opaque payload, not interpreted
                let len = self.cursor.read_vlq()?;
                self.cursor.skip(len as usize);
            }
            0x20 | 0x21 => self.cursor.skip(2),
            0x2F => {
                self.cursor.assert_byte(0)?;
                self.end_track();
            }
            0x51 => {
                self.cursor.assert_byte(3)?;
                let value = self.cursor.read_u24_be()?;
                self.record_tempo(value);
            }
            0x58 | 0xF4 => self.cursor.skip(5),
            0x59 => self.cursor.skip(3),
            0x7F => {
                let len = self.cursor.read_vlq()?;
                self.cursor.skip(len as usize);
            }
            _ => return Err(Error::TrackCorrupted),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &[u8]) -> ParsedTrack {
        TrackParser::new(0, body).parse_all().unwrap()
    }

    const END_OF_TRACK: [u8; 4] = [0x00, 0xFF, 0x2F, 0x00];

    #[test]
    fn header_round_trip() {
        let bytes = [
            b'M', b'T', b'h', b'd', 0, 0, 0, 6, 0, 1, 0, 2, 0x01, 0xE0,
        ];
        let hdr = parse_midi_header(&bytes).unwrap();
        assert_eq!(hdr.format, MidiFormat::MultiSyncTracks);
        assert_eq!(hdr.track_count, 2);
        assert_eq!(hdr.division, 480);
    }

    #[test]
    fn bad_magic_is_header_corrupted() {
        let bytes = [b'X', b'T', b'h', b'd', 0, 0, 0, 6, 0, 1, 0, 1, 0x01, 0xE0];
        assert!(matches!(parse_midi_header(&bytes), Err(Error::HeaderCorrupted)));
    }

    #[test]
    fn bad_header_length_is_header_corrupted() {
        let bytes = [b'M', b'T', b'h', b'd', 0, 0, 0, 7, 0, 1, 0, 1, 0x01, 0xE0];
        assert!(matches!(parse_midi_header(&bytes), Err(Error::HeaderCorrupted)));
    }

    #[test]
    fn track_scan_records_offsets() {
        let mut bytes = vec![
            b'M', b'T', b'h', b'd', 0, 0, 0, 6, 0, 1, 0, 2, 0x01, 0xE0,
        ];
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(&END_OF_TRACK);
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(&END_OF_TRACK);

        let headers = scan_track_headers(&bytes, 2).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].offset, 22);
        assert_eq!(headers[0].size, 4);
        assert_eq!(headers[1].offset, 34);
        assert_eq!(headers[1].index, 1);
    }

    #[test]
    fn bad_track_magic_is_track_header_corrupted() {
        let mut bytes = vec![0u8; 14];
        bytes.extend_from_slice(b"MTrX");
        bytes.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            scan_track_headers(&bytes, 1),
            Err(Error::TrackHeaderCorrupted)
        ));
    }

    #[test]
    fn note_pair_produces_one_note() {
        let body = [
            0x00, 0x90, 60, 100, // on
            0x60, 0x80, 60, 0, // off after 96 ticks
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track = parse(&body);
        assert_eq!(track.notes, vec![RenderNote { pitch: 60, track: 0, start: 0, end: 96 }]);
        assert_eq!(track.end_tick, 96);
    }

    #[test]
    fn running_status_matches_explicit_status() {
        // same two notes, once with the status byte repeated and once
        // relying on running status
        let explicit = [
            0x00, 0x90, 60, 100,
            0x10, 0x90, 64, 100,
            0x10, 0x80, 60, 0,
            0x10, 0x80, 64, 0,
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let running = [
            0x00, 0x90, 60, 100,
            0x10, 64, 100,
            0x10, 0x80, 60, 0,
            0x10, 64, 0,
            0x00, 0xFF, 0x2F, 0x00,
        ];
        assert_eq!(parse(&explicit).notes, parse(&running).notes);
    }

    #[test]
    fn zero_velocity_note_on_closes() {
        let body = [
            0x00, 0x90, 60, 100,
            0x30, 0x90, 60, 0,
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track = parse(&body);
        assert_eq!(track.notes[0].end, 0x30);
    }

    #[test]
    fn overlapping_same_key_presses_close_lifo() {
        let body = [
            0x00, 0x90, 60, 100, // first press
            0x10, 0x90, 60, 100, // second press, same key
            0x10, 0x80, 60, 0, // closes the second (most recent)
            0x10, 0x80, 60, 0, // closes the first
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track = parse(&body);
        assert_eq!(track.notes[0].start, 0);
        assert_eq!(track.notes[0].end, 0x30);
        assert_eq!(track.notes[1].start, 0x10);
        assert_eq!(track.notes[1].end, 0x20);
    }

    #[test]
    fn note_off_without_open_note_is_noop() {
        let body = [
            0x00, 0x80, 60, 0,
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track = parse(&body);
        assert!(track.notes.is_empty());
    }

    #[test]
    fn unterminated_notes_close_at_end_of_track() {
        let body = [
            0x00, 0x90, 60, 100,
            0x20, 0x90, 72, 100,
            0x40, 0xFF, 0x2F, 0x00,
        ];
        let track = parse(&body);
        assert_eq!(track.end_tick, 0x60);
        for n in &track.notes {
            assert_eq!(n.end, 0x60);
            assert!(n.end >= n.start);
        }
    }

    #[test]
    fn channels_track_open_notes_independently() {
        let body = [
            0x00, 0x90, 60, 100, // channel 0
            0x00, 0x91, 60, 100, // channel 1, same key
            0x10, 0x80, 60, 0, // closes channel 0's note only
            0x10, 0x81, 60, 0,
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track = parse(&body);
        assert_eq!(track.notes[0].end, 0x10);
        assert_eq!(track.notes[1].end, 0x20);
    }

    #[test]
    fn tempo_events_record_and_overwrite_same_tick() {
        let body = [
            0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, // 500000
            0x00, 0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40, // 1000000, same tick
            0x60, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20,
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track = parse(&body);
        assert_eq!(track.tempos.len(), 2);
        assert_eq!(track.tempos[0].tick, 0);
        assert_eq!(track.tempos[0].value, 1_000_000);
        assert_eq!(track.tempos[1].tick, 0x60);
        assert_eq!(track.tempos[1].value, 500_000);
    }

    #[test]
    fn skipped_events_leave_the_clock_consistent() {
        let body = [
            0x00, 0xB0, 7, 100, // control change
            0x00, 0xC0, 5, // program change
            0x00, 0xE0, 0, 64, // pitch wheel
            0x00, 0xF0, 1, 2, 3, 0xF7, // sysex until terminator
            0x00, 0xFF, 0x01, 0x03, b'a', b'b', b'c', // text event
            0x00, 0xFF, 0x58, 0x04, 4, 2, 24, 8, // time signature (5 bytes)
            0x00, 0xFF, 0x59, 0x02, 0, 0, // key signature (3 bytes)
            0x10, 0x90, 60, 100,
            0x10, 0x80, 60, 0,
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track = parse(&body);
        assert_eq!(track.notes.len(), 1);
        assert_eq!(track.notes[0].start, 0x10);
        assert_eq!(track.notes[0].end, 0x20);
    }

    #[test]
    fn unknown_meta_type_is_track_corrupted() {
        let body = [0x00, 0xFF, 0x60, 0x00];
        let err = TrackParser::new(0, &body).parse_all().unwrap_err();
        assert!(matches!(err, Error::TrackCorrupted));
    }

    #[test]
    fn bad_meta_length_is_assertion_failure() {
        let body = [0x00, 0xFF, 0x51, 0x04, 0, 0, 0, 0];
        let err = TrackParser::new(0, &body).parse_all().unwrap_err();
        assert!(matches!(err, Error::AssertionFailed { expected: 3, actual: 4 }));
    }

    #[test]
    fn truncated_track_is_out_of_range() {
        let body = [0x00, 0x90, 60];
        let err = TrackParser::new(0, &body).parse_all().unwrap_err();
        assert!(matches!(err, Error::OutOfRange));
    }
}
