use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Everything a render run needs to know; validated by the CLI layer before
/// it reaches the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderOptions {
    pub width: usize,
    pub height: usize,
    /// Height of the keyboard row in pixels (the CLI derives 15% of height).
    pub key_height: usize,
    pub fps: u32,
    pub note_speed: f32,
    /// ffmpeg constant rate factor, 0-51.
    pub crf: u8,
    /// Divider bar color as R, G, B, A.
    pub bar_color: [u8; 4],
    /// Worker threads for the parallel lane pass; 0 means all cores.
    pub max_threads: usize,
    pub multithreaded: bool,
    pub remove_overlap: bool,
    pub no_encoder_log: bool,
    pub quiet: bool,
    pub preview: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            key_height: 1080 * 15 / 100,
            fps: 60,
            note_speed: 1.0,
            crf: 17,
            bar_color: [0x80, 0x00, 0x00, 0xFF],
            max_threads: 0,
            multithreaded: true,
            remove_overlap: true,
            no_encoder_log: false,
            quiet: false,
            preview: false,
        }
    }
}

impl RenderOptions {
    /// Divider bar color packed into the canvas pixel format.
    pub fn bar_color_packed(&self) -> u32 {
        let [r, g, b, a] = self.bar_color;
        u32::from(a) << 24 | u32::from(b) << 16 | u32::from(g) << 8 | u32::from(r)
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let ron_string = fs::read_to_string(path)?;
        let options: RenderOptions = ron::from_str(&ron_string)?;
        Ok(options)
    }
}
