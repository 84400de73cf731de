use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::warn;

use crate::error::{Error, Result};
use crate::options::RenderOptions;

/// Where completed frames go. The engine writes whole frames in emission
/// order and calls `finish` exactly once at the end of the run.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Streams raw RGBA frames into an `ffmpeg` child process over its stdin
/// pipe. `ffmpeg` must be on `PATH`; a slow encoder throttles the render
/// loop through the blocking pipe write.
pub struct EncoderSink {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
}

impl EncoderSink {
    pub fn spawn(options: &RenderOptions, out_path: &Path) -> Result<Self> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y").arg("-hide_banner");
        if options.no_encoder_log || options.quiet {
            cmd.args(["-loglevel", "quiet"]);
        }
        cmd.args(["-f", "rawvideo", "-pix_fmt", "rgba"])
            .arg("-s")
            .arg(format!("{}x{}", options.width, options.height))
            .arg("-r")
            .arg(options.fps.to_string())
            .args(["-i", "-", "-pix_fmt", "yuv420p", "-preset", "ultrafast"])
            .arg("-crf")
            .arg(options.crf.to_string())
            .arg(out_path);
        if options.preview {
            cmd.args(["-f", "sdl", "preview"]);
        }
        cmd.stdin(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Encoder(format!("failed to spawn ffmpeg: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Encoder("ffmpeg stdin unavailable".into()))?;
        Ok(Self {
            child,
            stdin: Some(BufWriter::with_capacity(1 << 20, stdin)),
        })
    }
}

impl FrameSink for EncoderSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Encoder("encoder already finished".into()))?;
        stdin
            .write_all(frame)
            .map_err(|e| Error::Encoder(format!("frame write failed: {e}")))
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .flush()
                .map_err(|e| Error::Encoder(format!("flush failed: {e}")))?;
            // dropping stdin closes the pipe so ffmpeg can finalize
            drop(stdin);
            let status = self
                .child
                .wait()
                .map_err(|e| Error::Encoder(format!("wait failed: {e}")))?;
            if !status.success() {
                warn!(%status, "ffmpeg exited with a failure status");
            }
        }
        Ok(())
    }
}
