use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, CommandFactory, ErrorKind, Parser, Subcommand};
use serde::Serialize;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use clipsync::audio::{self, Fingerprinter, SpectralFingerprinter};
use clipsync::cache::DiskCache;
use clipsync::decode::{self, FfmpegCommand};
use clipsync::wave::{DecodedSoundFileFactory, SoundFileFactory};
use clipsync::{CancellationToken, Clip, ClipEventKind, ClipMatch, ClipState, Config, Synchronizer, WindowFunction};

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(after_help = "Displays info about clipsync and its configuration.")]
    Info,

    #[clap(
        arg_required_else_help = true,
        after_help = "Decode and fingerprint one or more media files. Fingerprints are cached in the temp directory and reused by the 'sync' command."
    )]
    Analyze {
        #[clap(
            required = true,
            multiple_values = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Media files or directories to analyze."
        )]
        paths: Vec<PathBuf>,
    },

    #[clap(
        arg_required_else_help = true,
        after_help = "Align one or more LQ recordings against a master recording and print the offset of each one. A positive offset means the LQ clip starts after the start of the master."
    )]
    Sync {
        #[clap(value_parser = clap::value_parser!(PathBuf), help = "Master (reference) recording.")]
        master: PathBuf,

        #[clap(
            required = true,
            multiple_values = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "LQ recordings or directories to align against the master."
        )]
        lq: Vec<PathBuf>,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Write a JSON report alongside each LQ clip."
        )]
        write_report: bool,

        #[clap(
            long,
            value_parser = clap::value_parser!(PathBuf),
            help = "Save the part of the master that matches each LQ clip as a WAV file in this directory."
        )]
        export_dir: Option<PathBuf>,

        #[clap(
            long,
            value_parser = clap::value_parser!(PathBuf),
            help = "Save a copy of each LQ video with the matching master audio in this directory. Requires the ffmpeg executable."
        )]
        export_video: Option<PathBuf>,
    },

    #[clap(after_help = "Remove cached fingerprints and decoded audio from the temp directory.")]
    ClearCache,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        global = true,
        value_parser = clap::value_parser!(PathBuf),
        help = "JSON config file. Command-line flags override values from the file."
    )]
    config: Option<PathBuf>,

    #[clap(
        long,
        global = true,
        value_parser = clap::value_parser!(PathBuf),
        help = "Path to the ffmpeg executable."
    )]
    ffmpeg: Option<PathBuf>,

    #[clap(
        long,
        global = true,
        value_parser = clap::value_parser!(PathBuf),
        help = "Directory for decoded audio and cached fingerprints."
    )]
    temp_dir: Option<PathBuf>,

    #[clap(
        long,
        global = true,
        value_parser = clap::value_parser!(u64),
        help = "Maximum time to spend decoding a single file, in seconds."
    )]
    decode_timeout: Option<u64>,

    #[clap(
        long,
        global = true,
        value_parser = clap::value_parser!(usize),
        help = "Samples per analysis window. Must be a power of two; 128 suits short files, 4096 long recordings."
    )]
    window_length: Option<usize>,

    #[clap(
        long,
        global = true,
        value_parser = clap::value_parser!(usize),
        help = "Width of each frequency bucket, in FFT bins."
    )]
    freq_range_step: Option<usize>,

    #[clap(
        long,
        global = true,
        value_enum,
        help = "Window function applied before the transform."
    )]
    window_function: Option<WindowFunctionArg>,

    #[clap(
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "Run everything on a single thread."
    )]
    no_threading: bool,

    #[clap(
        short,
        long,
        global = true,
        action(ArgAction::Count),
        help = "Increase log verbosity (-v for debug, -vv for trace)."
    )]
    verbose: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum WindowFunctionArg {
    Hamming,
    Hann,
    Rectangular,
}

impl From<WindowFunctionArg> for WindowFunction {
    fn from(arg: WindowFunctionArg) -> Self {
        match arg {
            WindowFunctionArg::Hamming => WindowFunction::Hamming,
            WindowFunctionArg::Hann => WindowFunction::Hann,
            WindowFunctionArg::Rectangular => WindowFunction::Rectangular,
        }
    }
}

/// Per-clip result written next to each LQ clip with `--write-report`.
#[derive(Debug, Serialize)]
struct ClipReport<'a> {
    master: &'a Path,
    clip: &'a Path,
    state: ClipState,
    offset: Option<f64>,
    #[serde(rename = "match")]
    clip_match: Option<ClipMatch>,
}

impl Cli {
    fn exit_with_error(msg: impl std::fmt::Display) -> ! {
        let mut cmd = Cli::command();
        cmd.error(ErrorKind::InvalidValue, msg).exit();
    }

    fn config(&self) -> Config {
        let mut config = match &self.config {
            Some(path) => match Config::from_path(path) {
                Ok(c) => c,
                Err(e) => Self::exit_with_error(format!("invalid config file: {}", e)),
            },
            None => Config::default(),
        };

        if let Some(ffmpeg) = &self.ffmpeg {
            config = config.with_ffmpeg_path(ffmpeg);
        }
        if let Some(temp_dir) = &self.temp_dir {
            config = config.with_temp_dir(temp_dir);
        }
        if let Some(secs) = self.decode_timeout {
            config = config.with_decode_timeout(Duration::from_secs(secs));
        }

        let mut params = config.sync_params.clone();
        if let Some(window_length) = self.window_length {
            params = params.with_window_length(window_length);
        }
        if let Some(freq_range_step) = self.freq_range_step {
            params = params.with_freq_range_step(freq_range_step);
        }
        if let Some(window_function) = self.window_function {
            params = params.with_window_function(window_function.into());
        }
        if let Err(e) = params.validate() {
            Self::exit_with_error(e);
        }

        config.with_sync_params(params).with_threading(!self.no_threading)
    }

    fn find_media_files(paths: &[PathBuf]) -> Vec<PathBuf> {
        match clipsync::util::find_media_files(paths) {
            Err(e) => Self::exit_with_error(e),
            Ok(v) => v,
        }
    }
}

fn print_clip(clip: &Clip) {
    match clip.offset() {
        Some(offset) => println!(
            "{}: {} ({} windows matched)",
            clip.display_name(),
            clipsync::util::format_offset(offset),
            clip.match_result().map_or(0, |m| m.match_count)
        ),
        None => println!("{}: no match ({:?})", clip.display_name(), clip.state()),
    }
}

fn write_report(master: &Path, clip: &Clip) -> clipsync::Result<()> {
    let report = ClipReport {
        master,
        clip: clip.filename(),
        state: clip.state(),
        offset: clip.offset(),
        clip_match: clip.match_result(),
    };
    let path = clip.filename().with_extension(audio::REPORT_FILE_EXT);
    let f = std::fs::File::create(&path)?;
    serde_json::to_writer_pretty(f, &report)?;
    tracing::debug!("wrote report to {}", path.display());
    Ok(())
}

fn analyze(config: &Config, paths: &[PathBuf]) -> clipsync::Result<()> {
    let files = Cli::find_media_files(paths);
    if files.is_empty() {
        Cli::exit_with_error("no media files found in provided paths");
    }

    let cache = Arc::new(DiskCache::new(&config.temp_dir)?);
    let fingerprinter: Arc<dyn Fingerprinter> = Arc::new(
        SpectralFingerprinter::new(config.sync_params.clone(), cache)?.with_threading(false),
    );
    let sound_files: Arc<dyn SoundFileFactory> = Arc::new(DecodedSoundFileFactory::new(
        decode::from_config(config)?,
        &config.temp_dir,
    ));

    // Fingerprints land in the disk cache, where 'sync' picks them up.
    let run = |path: &PathBuf| -> clipsync::Result<()> {
        let clip = Clip::new(path, fingerprinter.clone(), sound_files.clone());
        clip.load(None)?;
        clip.calc_hashes()?;
        if let Some(fp) = clip.hashes() {
            println!(
                "{}: {} hashes ({})",
                clip.display_name(),
                fp.len(),
                clipsync::util::format_time(Duration::from_secs_f64(fp.duration_secs()))
            );
        }
        Ok(())
    };

    let mut results = Vec::new();
    if cfg!(feature = "rayon") && config.threading {
        #[cfg(feature = "rayon")]
        {
            results = files.par_iter().map(run).collect();
        }
    } else {
        results = files.iter().map(run).collect();
    }

    for (path, result) in files.iter().zip(&results) {
        if let Err(e) = result {
            tracing::error!("failed to analyze {}: {}", path.display(), e);
        }
    }

    Ok(())
}

fn sync(
    config: &Config,
    master: &Path,
    lq: &[PathBuf],
    write_reports: bool,
    export_dir: Option<&Path>,
    export_video: Option<&Path>,
) -> clipsync::Result<()> {
    let lq_files = Cli::find_media_files(lq);
    if lq_files.is_empty() {
        Cli::exit_with_error("no LQ media files found in provided paths");
    }

    let mut synchronizer = Synchronizer::new(config.clone())?;
    synchronizer.set_master(master)?;
    let clips: Vec<Arc<Clip>> = lq_files
        .iter()
        .map(|path| synchronizer.add_lq(path))
        .collect::<clipsync::Result<_>>()?;

    for event in synchronizer.wait() {
        match event.kind {
            ClipEventKind::Failed(ref reason) => {
                tracing::error!(clip = %event.display_name, "{}", reason)
            }
            ref kind => tracing::debug!(clip = %event.display_name, "{:?}", kind),
        }
    }

    let ffmpeg = FfmpegCommand::new(&config.ffmpeg_path).with_timeout(config.decode_timeout());
    let cancel = CancellationToken::new();

    for clip in &clips {
        print_clip(clip);

        if write_reports {
            if let Err(e) = write_report(master, clip) {
                tracing::error!(clip = clip.display_name(), "failed to write report: {}", e);
            }
        }

        if let (Some(dir), Some(_)) = (export_dir, clip.offset()) {
            std::fs::create_dir_all(dir)?;
            let dest = dir.join(clip.filename().with_extension("wav").file_name().unwrap_or_default());
            match synchronizer.save(clip.id(), &dest) {
                Ok(()) => println!("  saved master excerpt to {}", dest.display()),
                Err(e) => tracing::error!(clip = clip.display_name(), "failed to save excerpt: {}", e),
            }
        }

        if let (Some(dir), Some(_)) = (export_video, clip.offset()) {
            std::fs::create_dir_all(dir)?;
            let dest = dir.join(synced_file_name(clip.filename()));
            let result = synchronizer
                .media_export(clip.id(), true)
                .and_then(|export| ffmpeg.export(&export, &dest, &cancel));
            match result {
                Ok(()) => println!("  exported synchronized video to {}", dest.display()),
                Err(e) => tracing::error!(clip = clip.display_name(), "failed to export video: {}", e),
            }
        }
    }

    Ok(())
}

// `phone.mov` becomes `phone_synced.mov`.
fn synced_file_name(lq: &Path) -> PathBuf {
    let stem = lq.file_stem().unwrap_or_default().to_string_lossy();
    match lq.extension() {
        Some(ext) => PathBuf::from(format!("{}_synced.{}", stem, ext.to_string_lossy())),
        None => PathBuf::from(format!("{}_synced", stem)),
    }
}

fn info(config: &Config) {
    println!("clipsync version: {}", env!("CARGO_PKG_VERSION"));
    #[cfg(feature = "ffmpeg")]
    println!("FFmpeg version: {}", clipsync::util::ffmpeg_version_string());
    println!("ffmpeg executable: {}", config.ffmpeg_path.display());
    println!("Temp directory: {}", config.temp_dir.display());
    println!(
        "Window length: {}, frequency range step: {}, window function: {:?}",
        config.sync_params.window_length,
        config.sync_params.freq_range_step,
        config.sync_params.window_function
    );
}

fn main() -> clipsync::Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = args.config();

    match args.command {
        Commands::Info => info(&config),
        Commands::Analyze { ref paths } => analyze(&config, paths)?,
        Commands::Sync {
            ref master,
            ref lq,
            write_report,
            ref export_dir,
            ref export_video,
        } => {
            if !master.is_file() {
                Cli::exit_with_error(format!("master file '{}' not found", master.display()));
            }
            sync(
                &config,
                master,
                lq,
                write_report,
                export_dir.as_deref(),
                export_video.as_deref(),
            )?
        }
        Commands::ClearCache => {
            let mut synchronizer = Synchronizer::new(config)?;
            synchronizer.clear_cache()?;
            println!("Cleared cache in {}", synchronizer.temp_path().display());
        }
    }

    Ok(())
}
