use std::time::Instant;

use rayon::prelude::*;
use tracing::debug;

use crate::midi::{MidiFile, RenderNote, TempoEvent};
use crate::options::RenderOptions;
use crate::render::canvas::{build_palette, is_black_key, Canvas, LanePainter};
use crate::render::encoder::FrameSink;
use crate::render::overlap;
use crate::render::stats::{RenderStats, RunState, StatsHandle};
use crate::Result;

/// Trailing empty frames emitted after the last tick so the video does not
/// cut off abruptly.
pub const DRAIN_FRAMES: usize = 300;

/// The virtual clock starts this fraction of the first note's start tick
/// before zero, giving the opening notes a scroll-in.
const LEAD_IN_FACTOR: f64 = 0.15;

/// Vertical pixels covered by one quarter note at speed 1.
const PIXELS_PER_QUARTER: f64 = 520.0;

/// One pitch's notes with its persistent forward-only cursor.
pub struct Lane {
    pub pitch: u8,
    pub notes: Vec<RenderNote>,
    pub cursor: usize,
}

enum NoteStore {
    /// Single global sequence walked with one cursor (single-threaded mode).
    Flat(Vec<RenderNote>),
    /// 128 per-pitch lanes for the data-parallel pass.
    Lanes(Vec<Lane>),
}

/// Walks the merged timeline at the configured frame rate and rasterizes
/// each frame into the canvas, streaming completed frames to the sink.
pub struct Renderer {
    division: u16,
    max_tick: u64,
    first_note_start: u64,
    store: NoteStore,
    tempos: Vec<TempoEvent>,
    stats: StatsHandle,
    max_threads: usize,
}

impl Renderer {
    pub fn new(file: MidiFile, options: &RenderOptions) -> Self {
        let first_note_start = file.first_note_start();
        let MidiFile { header, notes, tempos, max_tick, .. } = file;
        let store = if options.multithreaded {
            let mut lanes: Vec<Lane> = (0u8..=127)
                .map(|pitch| Lane { pitch, notes: Vec::new(), cursor: 0 })
                .collect();
            for note in notes {
                lanes[usize::from(note.pitch)].notes.push(note);
            }
            if options.remove_overlap {
                overlap::resolve_overlaps(&mut lanes);
            }
            NoteStore::Lanes(lanes)
        } else {
            NoteStore::Flat(notes)
        };
        Self {
            division: header.division,
            max_tick,
            first_note_start,
            store,
            tempos,
            stats: StatsHandle::new(),
            max_threads: options.max_threads,
        }
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub fn division(&self) -> u16 {
        self.division
    }

    pub fn max_tick(&self) -> u64 {
        self.max_tick
    }

    pub fn tempos(&self) -> &[TempoEvent] {
        &self.tempos
    }

    /// Render the whole run into `sink`: lead-in, main frames, drain, then
    /// close the sink.
    pub fn run(&mut self, options: &RenderOptions, sink: &mut dyn FrameSink) -> Result<()> {
        let height = options.height;
        let key_height = options.key_height;
        let fps = f64::from(options.fps);
        let mut canvas = Canvas::new(options.width, height, key_height, options.bar_color_packed());
        let palette = build_palette();

        let ppb = PIXELS_PER_QUARTER / f64::from(self.division) * f64::from(options.note_speed);
        let delta_tick = (height - key_height) as f64 / ppb;
        let mut spd = f64::from(self.division) * 2.0 / fps;
        let mut tick = -(self.first_note_start as f64) * LEAD_IN_FACTOR;
        let max_tick = self.max_tick as f64;
        let mut tempo_cursor = 0usize;
        let mut flat_cursor = 0usize;
        if let NoteStore::Lanes(lanes) = &mut self.store {
            for lane in lanes.iter_mut() {
                lane.cursor = 0;
            }
        }

        let pool = match &self.store {
            NoteStore::Lanes(_) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.max_threads)
                    .build()
                    .expect("failed to build render thread pool"),
            ),
            NoteStore::Flat(_) => None,
        };

        debug!(ppb, delta_tick, max_tick, "starting render");
        let run_start = Instant::now();
        let mut frames = 0u64;
        self.stats.publish(RenderStats { state: RunState::Rendering, ..Default::default() });

        while tick <= max_tick {
            let frame_start = Instant::now();
            canvas.clear();
            let tick_up = tick + delta_tick;

            // the tempo cursor only moves forward; the timeline is sorted
            // and tick is non-decreasing
            while tempo_cursor < self.tempos.len() && self.tempos[tempo_cursor].tick as f64 <= tick
            {
                spd = 1e6 / f64::from(self.tempos[tempo_cursor].value) * f64::from(self.division)
                    / fps;
                tempo_cursor += 1;
            }

            let frame = FrameView { tick, tick_up, ppb, key_height, height };
            let drawn = match &mut self.store {
                NoteStore::Flat(notes) => {
                    draw_flat(notes, &mut flat_cursor, &mut canvas, frame, &palette)
                }
                NoteStore::Lanes(lanes) => {
                    let pool = pool.as_ref().expect("lane store implies a pool");
                    draw_lanes(lanes, pool, &mut canvas, frame, &palette)
                }
            };

            canvas.draw_keys();
            sink.write_frame(canvas.frame_bytes())?;

            frames += 1;
            let frame_secs = frame_start.elapsed().as_secs_f64();
            let total_secs = run_start.elapsed().as_secs_f64();
            self.stats.publish(RenderStats {
                state: RunState::Rendering,
                progress: if max_tick > 0.0 { tick / max_tick } else { 1.0 },
                current_tick: tick,
                notes_on_screen: drawn,
                render_fps: if frame_secs > 0.0 { 1.0 / frame_secs } else { 0.0 },
                average_fps: if total_secs > 0.0 { frames as f64 / total_secs } else { 0.0 },
                frames_rendered: frames,
            });

            tick += spd;
        }

        self.stats.publish(RenderStats {
            state: RunState::Draining,
            progress: 1.0,
            current_tick: max_tick,
            frames_rendered: frames,
            ..Default::default()
        });
        canvas.clear();
        canvas.draw_keys();
        for _ in 0..DRAIN_FRAMES {
            sink.write_frame(canvas.frame_bytes())?;
        }
        sink.finish()?;
        self.stats.publish(RenderStats {
            state: RunState::Done,
            progress: 1.0,
            current_tick: max_tick,
            frames_rendered: frames + DRAIN_FRAMES as u64,
            ..Default::default()
        });
        Ok(())
    }
}

/// Per-frame scalar context shared by both draw paths.
#[derive(Clone, Copy)]
struct FrameView {
    tick: f64,
    tick_up: f64,
    ppb: f64,
    key_height: usize,
    height: usize,
}

/// Rasterize one note. Returns true when the note is in progress at the
/// current tick (pinned to the keyboard top, key lit).
fn blit_note(painter: &LanePainter<'_>, n: &RenderNote, frame: FrameView, color: u32) -> bool {
    let (y, mut h, active);
    if (n.start as f64) < frame.tick {
        y = frame.key_height;
        h = ((n.end as f64 - frame.tick) * frame.ppb) as usize;
        active = true;
    } else {
        y = ((n.start as f64 - frame.tick) * frame.ppb) as usize + frame.key_height;
        h = ((n.end - n.start) as f64 * frame.ppb) as usize;
        active = false;
    }
    let room = frame.height.saturating_sub(y);
    if h > room {
        h = room;
    }
    painter.draw_note(n.pitch, y, h, color);
    active
}

fn draw_flat(
    notes: &[RenderNote],
    cursor: &mut usize,
    canvas: &mut Canvas,
    frame: FrameView,
    palette: &[u32; 96],
) -> u64 {
    let mut active: [Option<u32>; 128] = [None; 128];
    let mut drawn = 0u64;
    {
        let painter = canvas.lane_painter();
        let mut anchored = false;
        let mut scan = *cursor;
        while scan < notes.len() && (notes[scan].start as f64) < frame.tick_up {
            let n = notes[scan];
            if n.end as f64 >= frame.tick {
                let color = palette[usize::from(n.track % 96)];
                // re-anchor on the first note still visible; everything
                // before it has scrolled out for good
                if !anchored {
                    anchored = true;
                    *cursor = scan;
                }
                if blit_note(&painter, &n, frame, color) {
                    active[usize::from(n.pitch)] = Some(color);
                }
                drawn += 1;
            }
            scan += 1;
        }
    }
    for (pitch, color) in active.iter().enumerate() {
        if let Some(c) = color {
            canvas.set_key_color(pitch as u8, *c);
        }
    }
    drawn
}

fn draw_lanes(
    lanes: &mut [Lane],
    pool: &rayon::ThreadPool,
    canvas: &mut Canvas,
    frame: FrameView,
    palette: &[u32; 96],
) -> u64 {
    let results: Vec<(u8, u64, Option<u32>)> = {
        let painter = canvas.lane_painter();
        let draw = |lane: &mut Lane| -> (u8, u64, Option<u32>) {
            let mut drawn = 0u64;
            let mut active = None;
            let mut anchored = false;
            let mut scan = lane.cursor;
            while scan < lane.notes.len() && (lane.notes[scan].start as f64) < frame.tick_up {
                let n = lane.notes[scan];
                if n.end as f64 >= frame.tick {
                    let color = palette[usize::from(n.track % 96)];
                    if !anchored {
                        anchored = true;
                        lane.cursor = scan;
                    }
                    if blit_note(&painter, &n, frame, color) {
                        active = Some(color);
                    }
                    drawn += 1;
                }
                scan += 1;
            }
            (lane.pitch, drawn, active)
        };
        // two deterministic passes: white-key lanes first, then black-key
        // lanes over them, mirroring the keyboard's paint order; lanes
        // within one pass write pairwise-disjoint columns
        pool.install(|| {
            let mut out: Vec<(u8, u64, Option<u32>)> = lanes
                .par_iter_mut()
                .filter(|lane| !is_black_key(lane.pitch))
                .map(&draw)
                .collect();
            let black: Vec<(u8, u64, Option<u32>)> = lanes
                .par_iter_mut()
                .filter(|lane| is_black_key(lane.pitch))
                .map(&draw)
                .collect();
            out.extend(black);
            out
        })
    };

    let mut drawn = 0u64;
    for (pitch, count, active) in results {
        drawn += count;
        if let Some(color) = active {
            canvas.set_key_color(pitch, color);
        }
    }
    drawn
}
