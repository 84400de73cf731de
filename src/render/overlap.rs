use rayon::prelude::*;

use crate::render::engine::Lane;

/// Trim or collapse visually overlapping notes, independently per pitch
/// lane.
///
/// For each adjacent pair in start order: a partial overlap trims the
/// earlier note's end to the later note's start; an identical start with
/// `earlier.end <= later.end` collapses the earlier note to zero duration
/// (it stays in the sequence but draws as a 1-pixel sliver under the later
/// note). The final adjacent pair of a lane is never examined, and lanes
/// with fewer than three notes are left untouched.
pub fn resolve_overlaps(lanes: &mut [Lane]) {
    lanes.par_iter_mut().for_each(|lane| {
        let notes = &mut lane.notes;
        for i in 0..notes.len().saturating_sub(2) {
            let next = notes[i + 1];
            let curr = &mut notes[i];
            if curr.start < next.start && curr.end > next.start && curr.end < next.end {
                curr.end = next.start;
            } else if curr.start == next.start && curr.end <= next.end {
                curr.end = curr.start;
            }
        }
    });
}
