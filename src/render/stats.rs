use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::info;

use crate::midi::{ticks_to_time, TempoEvent};

/// Lifecycle of a render run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Rendering,
    Draining,
    Done,
}

/// Read-only run statistics, published once per frame and polled by the
/// progress reporter. Not part of the correctness contract.
#[derive(Debug, Clone, Default)]
pub struct RenderStats {
    pub state: RunState,
    /// Fraction of the tick range covered so far (can exceed 1 briefly on
    /// the final step).
    pub progress: f64,
    pub current_tick: f64,
    pub notes_on_screen: u64,
    /// Instantaneous frames per second.
    pub render_fps: f64,
    pub average_fps: f64,
    pub frames_rendered: u64,
}

/// Cheap cloneable handle publishing stats snapshots; readers always see a
/// consistent whole-frame snapshot.
#[derive(Clone)]
pub struct StatsHandle {
    inner: Arc<ArcSwap<RenderStats>>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(RenderStats::default())),
        }
    }

    pub fn publish(&self, stats: RenderStats) {
        self.inner.store(Arc::new(stats));
    }

    pub fn load(&self) -> Arc<RenderStats> {
        self.inner.load_full()
    }
}

impl Default for StatsHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll the stats once a second and log a progress line until the run
/// reports `Done`.
pub fn spawn_reporter(
    stats: StatsHandle,
    division: u16,
    tempos: Vec<TempoEvent>,
    max_tick: u64,
    fps: u32,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let full_time = ticks_to_time(max_tick, division, &tempos);
        let total_frames = (full_time.as_secs_f64() * f64::from(fps)) as u64;
        loop {
            let snapshot = stats.load();
            if snapshot.state == RunState::Done {
                break;
            }
            if snapshot.state != RunState::Idle {
                let tick = if snapshot.current_tick < 0.0 { 0 } else { snapshot.current_tick as u64 };
                let midi_time = ticks_to_time(tick, division, &tempos);
                info!(
                    progress = format_args!("{:.2}%", snapshot.progress * 100.0),
                    frame = snapshot.frames_rendered,
                    of = total_frames,
                    fps = format_args!("{:.1}", snapshot.render_fps),
                    avg_fps = format_args!("{:.1}", snapshot.average_fps),
                    notes_on_screen = snapshot.notes_on_screen,
                    midi_time = format_args!(
                        "{}:{:02} / {}:{:02}",
                        midi_time.as_secs() / 60,
                        midi_time.as_secs() % 60,
                        full_time.as_secs() / 60,
                        full_time.as_secs() % 60,
                    ),
                    "rendering"
                );
            }
            thread::sleep(Duration::from_secs(1));
        }
        info!("finished render");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_replaces_the_snapshot() {
        let handle = StatsHandle::new();
        assert_eq!(handle.load().state, RunState::Idle);
        handle.publish(RenderStats {
            state: RunState::Rendering,
            frames_rendered: 7,
            ..Default::default()
        });
        let snap = handle.load();
        assert_eq!(snap.state, RunState::Rendering);
        assert_eq!(snap.frames_rendered, 7);
    }

    #[test]
    fn reporter_exits_once_done() {
        let handle = StatsHandle::new();
        let reporter = spawn_reporter(handle.clone(), 480, Vec::new(), 0, 60);
        handle.publish(RenderStats { state: RunState::Done, ..Default::default() });
        reporter.join().unwrap();
    }
}
