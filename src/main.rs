use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quaver::render::stats::spawn_reporter;
use quaver::{EncoderSink, MidiFile, RenderOptions, Renderer};

fn show_help() {
    println!("quaver - MIDI piano-roll video renderer\n");
    println!("Options:");
    println!("  -f,  --mid <path>         input MIDI file");
    println!("  -o,  --out <path>         output video file");
    println!("  -w,  --width <px>         video width, default 1920");
    println!("  -h,  --height <px>        video height, default 1080");
    println!("  -ns, --notesize <x>       note speed multiplier (0.25-10), default 1");
    println!("  -crf <n>                  video quality (0-51, lower is larger), default 17");
    println!("  -fps, --fps <n>           frames per second (at least 24), default 60");
    println!("  -bc, --barcolor <r g b a> divider bar color, four values 0-255");
    println!("  -tc, --threadcount <n>    worker threads for multithreaded rendering");
    println!("  -st, --singlethread       render on a single thread");
    println!("  -nor, --disableor         keep overlapping notes (multithreaded only)");
    println!("  -nfl, --nofflog           suppress ffmpeg log output");
    println!("  -q,  --quiet              no output at all");
    println!("  -p,  --preview            live preview while encoding");
    println!("  -c,  --config <path>      load options from a RON file first\n");
    println!("Example: quaver -f ouranos.mid -o ouranos.mp4 -ns 1.2");
}

fn parse_args(args: &[String]) -> Result<(PathBuf, PathBuf, RenderOptions), String> {
    let mut midi_path: Option<PathBuf> = None;
    let mut out_path: Option<PathBuf> = None;
    let mut options = RenderOptions::default();
    // a config file provides its own key height; flags re-derive it
    let mut key_height_from_config = false;

    let mut i = 0;
    let next = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i).cloned().ok_or_else(|| format!("missing value for {flag}"))
    };

    while i < args.len() {
        match args[i].as_str() {
            "-f" | "--mid" => {
                let path = PathBuf::from(next(&mut i, "--mid")?);
                if !path.exists() {
                    return Err(format!("file not found: {}", path.display()));
                }
                midi_path = Some(path);
            }
            "-o" | "--out" => {
                let path = PathBuf::from(next(&mut i, "--out")?);
                if path.exists() {
                    eprintln!("warning: output file exists and will be overwritten");
                }
                out_path = Some(path);
            }
            "-c" | "--config" => {
                let path = PathBuf::from(next(&mut i, "--config")?);
                options = RenderOptions::load(&path)
                    .map_err(|e| format!("failed to load {}: {e}", path.display()))?;
                key_height_from_config = true;
            }
            "-crf" => {
                let crf: u8 = next(&mut i, "-crf")?
                    .parse()
                    .map_err(|_| "crf must be an integer between 0 and 51")?;
                if crf > 51 {
                    return Err("crf must be an integer between 0 and 51".into());
                }
                options.crf = crf;
            }
            "-fps" | "--fps" => {
                let fps: u32 = next(&mut i, "--fps")?
                    .parse()
                    .map_err(|_| "fps must be an integer of at least 24")?;
                if fps < 24 {
                    return Err("fps must be an integer of at least 24".into());
                }
                options.fps = fps;
            }
            "-w" | "--width" => {
                let width: usize = next(&mut i, "--width")?
                    .parse()
                    .map_err(|_| "width must be a positive integer")?;
                if width == 0 {
                    return Err("width must be a positive integer".into());
                }
                options.width = width;
            }
            "-h" | "--height" => {
                let height: usize = next(&mut i, "--height")?
                    .parse()
                    .map_err(|_| "height must be a positive integer")?;
                if height == 0 {
                    return Err("height must be a positive integer".into());
                }
                options.height = height;
                key_height_from_config = false;
            }
            "-ns" | "--notesize" => {
                let speed: f32 = next(&mut i, "--notesize")?
                    .parse()
                    .map_err(|_| "note speed must be between 0.25 and 10")?;
                if !(0.25..=10.0).contains(&speed) {
                    return Err("note speed must be between 0.25 and 10".into());
                }
                options.note_speed = speed;
            }
            "-tc" | "--threadcount" => {
                let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
                let tc: usize = next(&mut i, "--threadcount")?
                    .parse()
                    .map_err(|_| "thread count must be a positive integer")?;
                if tc == 0 || tc > 2 * cores {
                    return Err(format!("thread count must be between 1 and {}", 2 * cores));
                }
                options.max_threads = tc;
            }
            "-bc" | "--barcolor" => {
                let mut color = [0u8; 4];
                for slot in &mut color {
                    *slot = next(&mut i, "--barcolor")?
                        .parse()
                        .map_err(|_| "bar color components must be between 0 and 255")?;
                }
                options.bar_color = color;
            }
            "-st" | "--singlethread" => options.multithreaded = false,
            "-nor" | "--disableor" => options.remove_overlap = false,
            "-nfl" | "--nofflog" => options.no_encoder_log = true,
            "-q" | "--quiet" => options.quiet = true,
            "-p" | "--preview" => options.preview = true,
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    let Some(midi_path) = midi_path else {
        return Err("no MIDI path given".into());
    };
    let Some(out_path) = out_path else {
        return Err("no output path given".into());
    };
    if !key_height_from_config {
        options.key_height = options.height * 15 / 100;
    }
    Ok((midi_path, out_path, options))
}

fn run(midi_path: PathBuf, out_path: PathBuf, options: RenderOptions) -> quaver::Result<()> {
    let started = Instant::now();
    let file = MidiFile::load(&midi_path, options.quiet)?;
    if !options.quiet {
        info!(
            tracks = file.header.track_count,
            division = file.header.division,
            notes = file.note_count,
            max_tick = file.max_tick,
            "loaded midi file"
        );
    }

    let mut renderer = Renderer::new(file, &options);
    // the reporter would interleave with ffmpeg's own console output, so it
    // only runs when that output is suppressed
    let _reporter = (options.no_encoder_log && !options.quiet).then(|| {
        spawn_reporter(
            renderer.stats(),
            renderer.division(),
            renderer.tempos().to_vec(),
            renderer.max_tick(),
            options.fps,
        )
    });

    let mut sink = EncoderSink::spawn(&options, &out_path)?;
    renderer.run(&options, &mut sink)?;

    if !options.quiet {
        let elapsed = started.elapsed();
        info!(
            minutes = elapsed.as_secs() / 60,
            seconds = elapsed.as_secs() % 60,
            "render complete"
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        show_help();
        return ExitCode::SUCCESS;
    }

    let (midi_path, out_path, options) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let default_level = if options.quiet { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(midi_path, out_path, options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
