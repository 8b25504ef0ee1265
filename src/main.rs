//! lamco-video-governor - trace replay tool
//!
//! Replays a recorded damage trace through the per-window controllers and
//! prints the resulting diagnostics as JSON.
//!
//! Trace format, one JSON object per line:
//!
//! ```text
//! {"type": "damage", "t_ms": 0, "window": 1, "x": 100, "y": 100, "width": 320, "height": 240}
//! {"type": "resize", "t_ms": 500, "window": 1, "width": 1280, "height": 720}
//! {"type": "ping", "t_ms": 600, "latency_ms": 12.5}
//! ```

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lamco_video_governor::config::{Config, LoggingConfig};
use lamco_video_governor::damage::Rectangle;
use lamco_video_governor::pipeline::{
    ClientCapabilities, CodecFactory, CodecRegistry, CodecResult, ColorspaceConverter,
    ConverterRequest, ConverterSpec, EncoderRequest, EncoderSpec, VideoEncoder,
};
use lamco_video_governor::stats::{GlobalStats, GlobalStatsInfo};
use lamco_video_governor::window::{WindowDiagnostics, WindowEncodeContext};

/// Command-line arguments for lamco-video-governor
#[derive(Parser, Debug)]
#[command(name = "lamco-video-governor")]
#[command(version, about = "Replay damage traces through the adaptive encoding controllers", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LAMCO_GOVERNOR_CONFIG")]
    config: Option<PathBuf>,

    /// Codec registry (TOML, or JSON with a .json extension)
    #[arg(short, long, env = "LAMCO_GOVERNOR_REGISTRY")]
    registry: Option<PathBuf>,

    /// Client capabilities (JSON); defaults to everything the registry offers
    #[arg(long)]
    capabilities: Option<PathBuf>,

    /// Damage trace (JSON lines)
    #[arg(short, long)]
    trace: PathBuf,

    /// Initial window width
    #[arg(long, default_value = "1920")]
    width: u32,

    /// Initial window height
    #[arg(long, default_value = "1080")]
    height: u32,

    /// Plan a pipeline for this encoding at the end of the replay
    #[arg(short, long)]
    encoding: Option<String>,

    /// Source pixel format for pipeline planning
    #[arg(long, default_value = "BGRX")]
    src_format: String,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json|pretty|compact); overrides the config file
    #[arg(long)]
    log_format: Option<String>,

    /// Write logs to file (in addition to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TraceEvent {
    Damage {
        t_ms: u64,
        window: u32,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    },
    Resize {
        t_ms: u64,
        window: u32,
        width: u32,
        height: u32,
    },
    Ping {
        t_ms: u64,
        latency_ms: f64,
    },
}

#[derive(Debug, Serialize)]
struct Report {
    generated_at: String,
    trace: String,
    events: usize,
    skipped: usize,
    global: GlobalStatsInfo,
    windows: Vec<WindowDiagnostics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let _guard = init_logging(&args, &config.logging)?;

    info!("lamco-video-governor v{}", env!("CARGO_PKG_VERSION"));
    debug!("Config: {:?}", config);

    let registry = match &args.registry {
        Some(path) => CodecRegistry::load(path)?,
        None => CodecRegistry::default(),
    };
    info!(
        "Codec registry: {} encoders, {} converters, encodings {:?}",
        registry.encoders.len(),
        registry.converters.len(),
        registry.encodings()
    );
    let capabilities = match &args.capabilities {
        Some(path) => load_capabilities(path)?,
        None => capabilities_for(&registry),
    };

    let report = replay(&args, &config, Arc::new(registry), capabilities)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_capabilities(path: &Path) -> Result<ClientCapabilities> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read capabilities: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse capabilities: {}", path.display()))
}

/// A client that decodes whatever the registry can produce
fn capabilities_for(registry: &CodecRegistry) -> ClientCapabilities {
    let mut caps = ClientCapabilities {
        scaling: true,
        subregion: true,
        batching: true,
        ..Default::default()
    };
    for encoder in &registry.encoders {
        let accepted = caps.colorspaces.entry(encoder.encoding.clone()).or_default();
        for cs in &encoder.output_colorspaces {
            if !accepted.contains(cs) {
                accepted.push(cs.clone());
            }
        }
    }
    caps
}

fn replay(
    args: &Args,
    config: &Config,
    registry: Arc<CodecRegistry>,
    capabilities: ClientCapabilities,
) -> Result<Report> {
    let file = std::fs::File::open(&args.trace)
        .with_context(|| format!("Failed to open trace: {}", args.trace.display()))?;

    let factory: Arc<dyn CodecFactory> = Arc::new(PlanningFactory);
    let global = GlobalStats::new();
    let mut windows: BTreeMap<u32, WindowEncodeContext> = BTreeMap::new();
    let start = Instant::now();
    let mut last = start;
    let (mut events, mut skipped) = (0usize, 0usize);

    let context = |id: u32| {
        WindowEncodeContext::new(
            id,
            args.width,
            args.height,
            config,
            Arc::clone(&registry),
            capabilities.clone(),
            Arc::clone(&factory),
        )
    };

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read trace line {}", lineno + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: TraceEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("line {}: {}", lineno + 1, e);
                skipped += 1;
                continue;
            }
        };
        events += 1;

        match event {
            TraceEvent::Damage {
                t_ms,
                window,
                x,
                y,
                width,
                height,
            } => {
                let now = start + Duration::from_millis(t_ms);
                let rect = match Rectangle::from_signed(x, y, width, height) {
                    Ok(rect) => rect,
                    Err(e) => {
                        warn!("line {}: {}", lineno + 1, e);
                        skipped += 1;
                        continue;
                    }
                };
                let ctx = windows.entry(window).or_insert_with(|| context(window));
                ctx.record_damage(rect, now);
                global.record_damage_packet_pixels(window, rect.area(), now);
                global.update_averages(now);
                ctx.update(&global, now);
                last = last.max(now);
            }
            TraceEvent::Resize {
                t_ms,
                window,
                width,
                height,
            } => {
                let now = start + Duration::from_millis(t_ms);
                windows
                    .entry(window)
                    .or_insert_with(|| context(window))
                    .resize(width, height, now);
                last = last.max(now);
            }
            TraceEvent::Ping { t_ms, latency_ms } => {
                let now = start + Duration::from_millis(t_ms);
                global.record_client_ping(latency_ms / 1000.0, now);
                last = last.max(now);
            }
        }
    }
    info!(
        "Replayed {} events ({} skipped) over {:?} in {} windows",
        events,
        skipped,
        last.saturating_duration_since(start),
        windows.len()
    );

    if let Some(encoding) = &args.encoding {
        for ctx in windows.values_mut() {
            let (width, height) = ctx.size();
            let rect = ctx
                .detector()
                .rectangle()
                .unwrap_or_else(|| Rectangle::full(width, height));
            if let Err(e) = ctx.ensure_pipeline(encoding, &args.src_format, rect, last) {
                warn!("window {}: {}", ctx.window_id(), e);
            }
        }
    }

    Ok(Report {
        generated_at: chrono::Utc::now().to_rfc3339(),
        trace: args.trace.display().to_string(),
        events,
        skipped,
        global: global.info(),
        windows: windows.values().map(WindowEncodeContext::diagnostics).collect(),
    })
}

// =============================================================================
// Planning codecs
// =============================================================================

/// Factory whose codecs only remember how they were configured
#[derive(Debug)]
struct PlanningFactory;

#[derive(Debug)]
struct PlannedConverter {
    codec_type: String,
    request: ConverterRequest,
}

impl ColorspaceConverter for PlannedConverter {
    fn codec_type(&self) -> &str {
        &self.codec_type
    }

    fn src_format(&self) -> &str {
        &self.request.src_format
    }

    fn dst_format(&self) -> &str {
        &self.request.dst_format
    }

    fn src_size(&self) -> (u32, u32) {
        (self.request.src_width, self.request.src_height)
    }

    fn dst_size(&self) -> (u32, u32) {
        (self.request.dst_width, self.request.dst_height)
    }

    fn clean(&mut self) {
        debug!("planned converter {} released", self.codec_type);
    }
}

#[derive(Debug)]
struct PlannedEncoder {
    codec_type: String,
    request: EncoderRequest,
}

impl VideoEncoder for PlannedEncoder {
    fn codec_type(&self) -> &str {
        &self.codec_type
    }

    fn encoding(&self) -> &str {
        &self.request.encoding
    }

    fn src_format(&self) -> &str {
        &self.request.src_format
    }

    fn size(&self) -> (u32, u32) {
        (self.request.width, self.request.height)
    }

    fn clean(&mut self) {
        debug!("planned encoder {} released", self.codec_type);
    }
}

impl CodecFactory for PlanningFactory {
    fn make_converter(
        &self,
        spec: &ConverterSpec,
        request: &ConverterRequest,
    ) -> CodecResult<Box<dyn ColorspaceConverter>> {
        Ok(Box::new(PlannedConverter {
            codec_type: spec.codec_type.clone(),
            request: request.clone(),
        }))
    }

    fn make_encoder(
        &self,
        spec: &EncoderSpec,
        request: &EncoderRequest,
    ) -> CodecResult<Box<dyn VideoEncoder>> {
        Ok(Box::new(PlannedEncoder {
            codec_type: spec.codec_type.clone(),
            request: request.clone(),
        }))
    }
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let log_level = match args.verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let format = args.log_format.as_deref().unwrap_or(&logging.format);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "lamco_video_governor={level},warn",
            level = log_level
        ))
    });

    // stdout carries the report, logs go to stderr
    if let Some(path) = &args.log_file {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let name = path
            .file_name()
            .with_context(|| format!("Invalid log file path: {}", path.display()))?;
        let (file, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));

        match format {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .try_init()?;
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .try_init()?;
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .try_init()?;
            }
        }
        info!("Logging to file: {}", path.display());
        return Ok(Some(guard));
    }

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()?;
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stderr),
                )
                .try_init()?;
        }
    }
    Ok(None)
}
