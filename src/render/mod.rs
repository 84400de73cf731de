//! Frame rasterization: canvas, parallel lane engine, encoder sink and run
//! statistics.

pub mod canvas;
pub mod encoder;
pub mod engine;
pub mod overlap;
pub mod stats;

pub use encoder::{EncoderSink, FrameSink};
pub use engine::Renderer;
pub use stats::{RenderStats, RunState, StatsHandle};
