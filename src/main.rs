use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, Command};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sticker_converter::{
    Config, ConversionRequest, ConvertError, Converter, MediaKind, OutputOptions,
    PipelineResult, StageReport,
};

/// Per-input outcome printed with `--report json`
#[derive(Debug, Serialize)]
struct JobReport {
    input: PathBuf,
    success: bool,
    output: Option<PathBuf>,
    source: Option<MediaKind>,
    target: MediaKind,
    mime_type: &'static str,
    size_bytes: Option<u64>,
    lossy_fallback: bool,
    elapsed_secs: Option<f64>,
    error: Option<String>,
    failed_stage: Option<String>,
    /// Per-stage tool invocations, exit codes and output tails
    diagnostics: Vec<StageReport>,
}

impl JobReport {
    fn from_outcome(
        input: &Path,
        target: MediaKind,
        outcome: &std::result::Result<PipelineResult, ConvertError>,
    ) -> Self {
        match outcome {
            Ok(result) => Self {
                input: input.to_path_buf(),
                success: true,
                output: Some(result.artifact.path().to_path_buf()),
                source: Some(result.source),
                target,
                mime_type: target.mime_type(),
                size_bytes: Some(result.size_bytes),
                lossy_fallback: result.lossy_fallback,
                elapsed_secs: Some(result.elapsed.as_secs_f64()),
                error: None,
                failed_stage: None,
                diagnostics: result.diagnostics.clone(),
            },
            Err(e) => Self {
                input: input.to_path_buf(),
                success: false,
                output: None,
                source: None,
                target,
                mime_type: target.mime_type(),
                size_bytes: None,
                lossy_fallback: false,
                elapsed_secs: None,
                error: Some(e.to_string()),
                failed_stage: e.stage().map(str::to_string),
                diagnostics: e.report().cloned().into_iter().collect(),
            },
        }
    }
}

fn cli() -> Command {
    Command::new("Sticker Converter")
        .version(env!("CARGO_PKG_VERSION"))
        .author("TigreRoll")
        .about("Convert stickers between image, GIF, video and vector animation formats")
        .arg(
            Arg::new("inputs")
                .value_name("FILE")
                .help("Input files to convert")
                .num_args(1..)
                .required_unless_present("check-tools"),
        )
        .arg(
            Arg::new("to")
                .short('t')
                .long("to")
                .value_name("KIND")
                .help("Target kind: static_image, animated_gif, video_sticker")
                .required_unless_present("check-tools"),
        )
        .arg(
            Arg::new("from")
                .short('f')
                .long("from")
                .value_name("KIND")
                .help("Source kind (detected from content when omitted)"),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .help("Output directory for converted stickers")
                .default_value("./output"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PX")
                .value_parser(clap::value_parser!(u32))
                .help("Maximum output width"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PX")
                .value_parser(clap::value_parser!(u32))
                .help("Maximum output height"),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("NUM")
                .value_parser(clap::value_parser!(u32))
                .help("Output frame rate"),
        )
        .arg(
            Arg::new("quality")
                .short('q')
                .long("quality")
                .value_name("0-100")
                .value_parser(clap::value_parser!(u32))
                .help("Output quality"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_name("NUM")
                .value_parser(clap::value_parser!(u32))
                .help("Threads per tool invocation (0 = all cores)"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .value_name("FORMAT")
                .value_parser(["text", "json"])
                .default_value("text")
                .help("Result report format"),
        )
        .arg(
            Arg::new("check-tools")
                .long("check-tools")
                .help("Verify the configured external tools and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
}

fn output_options(matches: &clap::ArgMatches, defaults: OutputOptions) -> OutputOptions {
    let mut options = defaults;
    if let Some(width) = matches.get_one::<u32>("width") {
        options.width = *width;
    }
    if let Some(height) = matches.get_one::<u32>("height") {
        options.height = *height;
    }
    if let Some(fps) = matches.get_one::<u32>("fps") {
        options.fps = *fps;
    }
    if let Some(quality) = matches.get_one::<u32>("quality") {
        options.quality = *quality;
    }
    if let Some(threads) = matches.get_one::<u32>("threads") {
        options.threads = *threads;
    }
    options
}

/// One destination per input; repeated stems get a `-2`, `-3`, ... suffix
fn destinations(output_dir: &Path, inputs: &[PathBuf], target: MediaKind) -> Vec<PathBuf> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    inputs
        .iter()
        .map(|input| {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "sticker".to_string());
            let count = seen.entry(stem.clone()).or_insert(0);
            *count += 1;
            let name = if *count == 1 {
                format!("{}.{}", stem, target.extension())
            } else {
                format!("{}-{}.{}", stem, count, target.extension())
            };
            output_dir.join(name)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::load_from(Path::new(path))?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Failed to load config, using defaults: {:#}", e);
            Config::default()
        }),
    };

    let verbose = matches.get_flag("verbose");
    let filter = if verbose {
        EnvFilter::new("sticker_converter=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("🚀 Sticker Converter starting...");
    info!("{}", config.summary());

    if matches.get_flag("check-tools") {
        config.tools.verify().await?;
        return Ok(());
    }

    let target: MediaKind = matches
        .get_one::<String>("to")
        .ok_or_else(|| anyhow!("--to is required"))?
        .parse()?;
    let source: Option<MediaKind> = matches
        .get_one::<String>("from")
        .map(|s| s.parse::<MediaKind>())
        .transpose()?;
    let options = output_options(&matches, config.output);
    let output_dir = PathBuf::from(
        matches
            .get_one::<String>("output-dir")
            .map(String::as_str)
            .unwrap_or("./output"),
    );
    let json_report = matches.get_one::<String>("report").map(String::as_str) == Some("json");
    let inputs: Vec<PathBuf> = matches
        .get_many::<String>("inputs")
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default();

    tokio::fs::create_dir_all(&output_dir)
        .await
        .with_context(|| format!("creating {}", output_dir.display()))?;

    info!("📂 Output directory: {}", output_dir.display());
    info!("🎯 Target: {} ({} inputs)", target, inputs.len());

    let converter = Converter::new(config)?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling conversions");
            signal_token.cancel();
        }
    });

    let start_time = std::time::Instant::now();
    let outputs = destinations(&output_dir, &inputs, target);
    let jobs = inputs.iter().zip(outputs).map(|(input, destination)| {
        let converter = converter.clone();
        let cancel = cancel.clone();
        let mut request = ConversionRequest::from_path(input, target)
            .with_options(options)
            .with_destination(destination);
        if let Some(source) = source {
            request = request.with_source(source);
        }
        async move { converter.convert_with_cancel(request, &cancel).await }
    });
    let outcomes = futures::future::join_all(jobs).await;
    let duration = start_time.elapsed();

    let mut successful = 0usize;
    let mut reports = Vec::with_capacity(outcomes.len());
    for (input, outcome) in inputs.iter().zip(&outcomes) {
        match outcome {
            Ok(result) => {
                successful += 1;
                info!(
                    "✅ {} -> {}",
                    input.display(),
                    result.artifact.path().display()
                );
            }
            Err(e) => {
                error!("❌ {}: {}", input.display(), e);
                if let Some(report) = e.report() {
                    let text = report.output_text();
                    if !text.is_empty() {
                        error!("Tool output:\n{}", text);
                    }
                }
            }
        }
        reports.push(JobReport::from_outcome(input, target, outcome));
    }

    let failed = inputs.len() - successful;
    info!("🎉 Processing completed in {:.2}s", duration.as_secs_f64());
    info!("✅ Successful: {}", successful);
    info!("❌ Failed: {}", failed);

    if json_report {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} conversions failed", failed, inputs.len()));
    }
    Ok(())
}
