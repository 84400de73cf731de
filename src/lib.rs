//! Renders a standard MIDI file to a scrolling piano-roll video by
//! streaming raw RGBA frames into an external encoder.

pub mod error;
pub mod midi;
pub mod options;
pub mod render;

pub use error::{Error, Result};
pub use midi::MidiFile;
pub use options::RenderOptions;
pub use render::{EncoderSink, FrameSink, Renderer};
