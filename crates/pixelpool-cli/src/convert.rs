//! Convert command implementation for Pixelpool CLI.
//!
//! Reads every input, submits all of them to the worker pool at once, writes
//! the outputs next to the inputs (or into `--out-dir`) and prints a report.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, ValueEnum};
use futures::future::join_all;
use pixelpool_core::{ConvertJob, ImageFormat, Isolation, PoolConfig, WorkerPool};

use crate::report::{FileReport, FileStatus, Report, format_bytes};

/// Inputs above this size are skipped.
pub const MAX_FILE_SIZE_BYTES: u64 = 20 * 1024 * 1024;

/// Quality presets. All of them are lossy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Preset {
    /// High quality (95%)
    High,
    /// Sweet spot (70%)
    #[default]
    SweetSpot,
    /// Lossy (45%)
    Lossy,
    /// Ultra (25%)
    Ultra,
}

impl Preset {
    pub fn quality(self) -> u8 {
        match self {
            Preset::High => 95,
            Preset::SweetSpot => 70,
            Preset::Lossy => 45,
            Preset::Ultra => 25,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ConvertArgs {
    /// Image files to convert
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Target format (webp, png, jpeg)
    #[arg(short, long, default_value = "webp")]
    pub format: ImageFormat,

    /// Compression preset
    #[arg(short, long, value_enum, default_value_t = Preset::SweetSpot)]
    pub preset: Preset,

    /// Encoder quality 1-100, overrides the preset
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: Option<u8>,

    /// Encode losslessly where the format allows it
    #[arg(long)]
    pub lossless: bool,

    /// Maximum output width in pixels
    #[arg(long)]
    pub max_width: Option<u32>,

    /// Maximum output height in pixels
    #[arg(long)]
    pub max_height: Option<u32>,

    /// Scale every image to this percentage of its original size
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub resize_percent: Option<u8>,

    /// Number of execution contexts [default: 4, capped by available cores]
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// How execution contexts are hosted
    #[arg(long)]
    pub isolation: Option<Isolation>,

    /// Directory for converted files [default: next to each input]
    #[arg(short, long)]
    pub out_dir: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Options applied to every file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Settings {
    format: ImageFormat,
    quality: u8,
    lossless: bool,
    max_width: u32,
    max_height: u32,
    resize_percent: Option<u8>,
}

impl Settings {
    fn from_args(args: &ConvertArgs) -> Self {
        Self {
            format: args.format,
            quality: args.quality.unwrap_or_else(|| args.preset.quality()),
            lossless: args.lossless,
            max_width: args.max_width.unwrap_or(0),
            max_height: args.max_height.unwrap_or(0),
            resize_percent: args.resize_percent.filter(|&p| p < 100),
        }
    }

    /// Build the job for one input, applying percentage resizing if asked.
    fn job_for(&self, input: Vec<u8>) -> anyhow::Result<ConvertJob> {
        let (mut max_width, mut max_height) = (self.max_width, self.max_height);

        if let Some(percent) = self.resize_percent {
            let (width, height) = image::ImageReader::new(Cursor::new(&input))
                .with_guessed_format()?
                .into_dimensions()
                .context("Failed to read image dimensions")?;
            let (scaled_width, scaled_height) = scale_dimensions(width, height, percent);
            max_width = tighter_bound(max_width, scaled_width);
            max_height = tighter_bound(max_height, scaled_height);
        }

        Ok(ConvertJob::new(input, self.format)
            .with_quality(self.quality)
            .with_lossless(self.lossless)
            .with_max_size(max_width, max_height))
    }
}

/// Execute the convert command.
pub async fn execute(args: ConvertArgs) -> anyhow::Result<()> {
    let settings = Settings::from_args(&args);
    tracing::debug!("Conversion settings: {:?}", settings);

    if let Some(dir) = &args.out_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }

    let mut config = PoolConfig::from_env();
    if let Some(workers) = args.workers {
        config = config.with_concurrency(workers);
    }
    if let Some(isolation) = args.isolation {
        config = config.with_isolation(isolation);
    }

    let (accepted, skipped) = partition_by_size(&args.files).await;
    warn_skipped(&skipped);

    let pool = WorkerPool::new(&config);
    pool.init().await.context("Failed to start worker pool")?;
    tracing::debug!(
        "Converting {} file(s) with {} {} context(s)",
        accepted.len(),
        pool.size(),
        config.isolation
    );

    let conversions = accepted
        .into_iter()
        .map(|(path, size)| convert_file(&pool, &settings, args.out_dir.as_deref(), path, size));
    let results = join_all(conversions).await;
    pool.shutdown().await;

    let mut files = skipped;
    for result in results {
        files.push(result?);
    }

    let report = Report::new(files);
    if args.json {
        println!("{}", report.to_json()?);
    } else {
        report.print();
    }

    if report.has_failures() {
        anyhow::bail!(
            "{} of {} file(s) failed to convert",
            report.totals.failed_files,
            report.files.len()
        );
    }
    Ok(())
}

/// Split inputs into those small enough to convert and skipped ones.
///
/// Files that cannot be inspected are kept and fail when read.
async fn partition_by_size(files: &[PathBuf]) -> (Vec<(PathBuf, u64)>, Vec<FileReport>) {
    let mut accepted = Vec::new();
    let mut skipped = Vec::new();

    for path in files {
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        if size > MAX_FILE_SIZE_BYTES {
            skipped.push(FileReport {
                input: path.clone(),
                original_bytes: size,
                status: FileStatus::Skipped {
                    reason: format!("larger than {}", format_bytes(MAX_FILE_SIZE_BYTES)),
                },
            });
        } else {
            accepted.push((path.clone(), size));
        }
    }

    (accepted, skipped)
}

fn warn_skipped(skipped: &[FileReport]) {
    if skipped.is_empty() {
        return;
    }

    let names: Vec<String> = skipped
        .iter()
        .take(2)
        .map(|file| file_name(&file.input))
        .collect();
    let suffix = if skipped.len() > 2 { ", ..." } else { "" };
    tracing::warn!(
        "Skipped {} file(s) over {}: {}{}",
        skipped.len(),
        format_bytes(MAX_FILE_SIZE_BYTES),
        names.join(", "),
        suffix
    );
}

/// Convert one file.
///
/// Problems local to this file become an error entry in the report. Failures
/// of the pool as a whole are returned as `Err` and abort the command.
async fn convert_file(
    pool: &WorkerPool,
    settings: &Settings,
    out_dir: Option<&Path>,
    path: PathBuf,
    size: u64,
) -> anyhow::Result<FileReport> {
    let failed = |path: PathBuf, error: String| FileReport {
        input: path,
        original_bytes: size,
        status: FileStatus::Error { error },
    };

    let input = match tokio::fs::read(&path).await {
        Ok(input) => input,
        Err(e) => return Ok(failed(path, format!("Failed to read file: {}", e))),
    };
    let original_bytes = input.len() as u64;

    let job = match settings.job_for(input) {
        Ok(job) => job,
        Err(e) => return Ok(failed(path, format!("{:#}", e))),
    };

    let output = match pool.submit(job).await {
        Ok(output) => output,
        Err(e) if e.is_scoped() => return Ok(failed(path, e.to_string())),
        Err(e) => {
            return Err(e).with_context(|| format!("Worker pool failed while converting {}", path.display()));
        }
    };

    let output_path = output_path(&path, out_dir, settings.format);
    if let Err(e) = tokio::fs::write(&output_path, &output).await {
        return Ok(failed(
            path,
            format!("Failed to write {}: {}", output_path.display(), e),
        ));
    }
    tracing::debug!("Wrote {} ({} bytes)", output_path.display(), output.len());

    Ok(FileReport {
        input: path,
        original_bytes,
        status: FileStatus::Done {
            output: output_path,
            converted_bytes: output.len() as u64,
        },
    })
}

/// Replace the file extension with the target format's.
pub fn replace_extension(name: &str, format: ImageFormat) -> String {
    // Only a non-empty final suffix counts, so "file." keeps its dot and a
    // bare ".hidden" is all extension.
    let base = match name.rfind('.') {
        Some(dot) if dot + 1 < name.len() => &name[..dot],
        _ => name,
    };
    format!("{}.{}", base, format.extension())
}

fn output_path(input: &Path, out_dir: Option<&Path>, format: ImageFormat) -> PathBuf {
    let name = replace_extension(&file_name(input), format);
    match out_dir {
        Some(dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Scale dimensions by a percentage, never below one pixel.
pub fn scale_dimensions(width: u32, height: u32, percent: u8) -> (u32, u32) {
    let scale = f64::from(percent.clamp(1, 100)) / 100.0;
    let scaled = |value: u32| ((f64::from(value) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

/// Combine an explicit bound with a computed one. 0 means unbounded.
fn tighter_bound(explicit: u32, computed: u32) -> u32 {
    if explicit == 0 {
        computed
    } else {
        explicit.min(computed)
    }
}
