//! ffmpeg-backed media transformer.
//!
//! The source is scaled to `width` tiles across, padded with transparency to a
//! whole number of rows and cut into square VP9 WebM tiles, one ffmpeg run per
//! tile. Tiles of alpha-capable sources that are transparent for the whole
//! clip are reported as placeholders.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use stk_core::{
    config::Config,
    errors::Error,
    ports::{ItemFormat, ItemRole, Layout, MediaTransformer, ProducedItem},
    Result,
};
use tokio::process::Command;
use tracing::{debug, info};

const STDERR_TAIL_MAX_BYTES: usize = 4 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 40;

/// Upper bound for a single ffmpeg/ffprobe invocation.
const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Clone, Debug)]
pub struct FfmpegConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Edge of one square tile, in pixels.
    pub tile_size: u32,
    /// Maximum clip length taken from the source.
    pub clip_seconds: u32,
}

impl FfmpegConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ffmpeg: cfg.ffmpeg_path.clone(),
            ffprobe: cfg.ffprobe_path.clone(),
            tile_size: cfg.tile_size.max(16),
            clip_seconds: cfg.clip_seconds.max(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FfmpegTransformer {
    cfg: FfmpegConfig,
}

impl FfmpegTransformer {
    pub fn new(cfg: FfmpegConfig) -> Self {
        Self { cfg }
    }

    async fn probe(&self, source: &Path) -> Result<ProbeInfo> {
        let source_arg = source.to_string_lossy().into_owned();
        let args = [
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,pix_fmt:format=duration",
            "-of",
            "json",
            source_arg.as_str(),
        ];
        let out = run_tool(&self.cfg.ffprobe, &args).await?;
        parse_probe(&out.stdout)
    }

    async fn render_tile(
        &self,
        source: &Path,
        still: bool,
        plan: &GridPlan,
        row: u32,
        col: u32,
        dest: &Path,
    ) -> Result<()> {
        let clip = self.cfg.clip_seconds.to_string();
        let filter = tile_filter(plan, row, col);
        let source_arg = source.to_string_lossy().into_owned();
        let dest_arg = dest.to_string_lossy().into_owned();

        let mut args: Vec<&str> = vec!["-y", "-v", "error"];
        if still {
            args.extend(["-loop", "1"]);
        }
        args.extend([
            "-t",
            clip.as_str(),
            "-i",
            source_arg.as_str(),
            "-vf",
            filter.as_str(),
            "-an",
            "-r",
            "30",
            "-c:v",
            "libvpx-vp9",
            "-pix_fmt",
            "yuva420p",
            "-b:v",
            "0",
            "-crf",
            "40",
            dest_arg.as_str(),
        ]);
        run_tool(&self.cfg.ffmpeg, &args).await?;
        Ok(())
    }

    /// Whether a rendered tile has zero alpha for its whole duration.
    async fn is_transparent(&self, tile: &Path, duration: f64) -> Result<bool> {
        let tile_arg = tile.to_string_lossy().into_owned();
        let args = [
            "-v",
            "info",
            "-c:v",
            "libvpx-vp9",
            "-i",
            tile_arg.as_str(),
            "-vf",
            "alphaextract,blackdetect=d=0:pix_th=0.01",
            "-f",
            "null",
            "-",
        ];
        let out = run_tool(&self.cfg.ffmpeg, &args).await?;
        Ok(covers_whole_clip(&out.stderr, duration))
    }
}

#[async_trait]
impl MediaTransformer for FfmpegTransformer {
    async fn plan(&self, source: &Path, layout: Layout) -> Result<usize> {
        let probe = self.probe(source).await?;
        let plan = GridPlan::new(probe.width, probe.height, layout.width, self.cfg.tile_size)?;
        Ok(plan.tiles())
    }

    async fn produce(
        &self,
        source: &Path,
        out_dir: &Path,
        layout: Layout,
    ) -> Result<Vec<ProducedItem>> {
        let probe = self.probe(source).await?;
        let plan = GridPlan::new(probe.width, probe.height, layout.width, self.cfg.tile_size)?;
        let still = is_still(source);
        let clip = f64::from(self.cfg.clip_seconds);
        let duration = if still {
            clip
        } else {
            probe.duration.map(|d| d.min(clip)).unwrap_or(clip)
        };
        debug!(
            source = %source.display(),
            width = probe.width,
            height = probe.height,
            cols = plan.cols,
            rows = plan.rows,
            "planned tile grid"
        );

        let mut items = Vec::with_capacity(plan.tiles());
        for row in 0..plan.rows {
            for col in 0..plan.cols {
                let dest = out_dir.join(format!("tile_{row:03}_{col:03}.webm"));
                self.render_tile(source, still, &plan, row, col, &dest).await?;

                let role = if probe.has_alpha() && self.is_transparent(&dest, duration).await? {
                    ItemRole::Placeholder
                } else {
                    ItemRole::Content
                };
                items.push(ProducedItem {
                    path: dest,
                    format: ItemFormat::Video,
                    role,
                });
            }
        }

        let placeholders = items
            .iter()
            .filter(|i| i.role == ItemRole::Placeholder)
            .count();
        info!(tiles = items.len(), placeholders, "rendered tiles");
        Ok(items)
    }
}

// ============== Probe ==============

#[derive(Clone, Debug, PartialEq)]
struct ProbeInfo {
    width: u32,
    height: u32,
    pix_fmt: Option<String>,
    duration: Option<f64>,
}

impl ProbeInfo {
    fn has_alpha(&self) -> bool {
        self.pix_fmt
            .as_deref()
            .map(|f| f.contains("yuva") || f.contains("rgba") || f.contains("argb") || f == "pal8")
            .unwrap_or(false)
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn parse_probe(json: &str) -> Result<ProbeInfo> {
    let out: ProbeOutput = serde_json::from_str(json)?;
    let stream = out
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| Error::External("source has no video stream".to_string()))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(Error::External("source has no dimensions".to_string()));
    };
    if width == 0 || height == 0 {
        return Err(Error::External(format!("source is {width}x{height}")));
    }
    Ok(ProbeInfo {
        width,
        height,
        pix_fmt: stream.pix_fmt,
        duration: out
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0),
    })
}

fn is_still(source: &Path) -> bool {
    source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// ============== Grid ==============

/// Geometry of the scaled, padded source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct GridPlan {
    cols: u32,
    rows: u32,
    tile: u32,
    scaled_width: u32,
    scaled_height: u32,
    /// Transparent rows added above the scaled source.
    pad_top: u32,
}

impl GridPlan {
    fn new(src_width: u32, src_height: u32, cols: u32, tile: u32) -> Result<Self> {
        if cols == 0 || tile == 0 {
            return Err(Error::External("grid needs at least one column".to_string()));
        }
        let scaled_width = cols * tile;
        let exact = u64::from(src_height) * u64::from(scaled_width) / u64::from(src_width.max(1));
        // Even heights keep yuv420 happy.
        let scaled_height = ((exact as u32).max(2) + 1) & !1;
        let rows = scaled_height.div_ceil(tile).max(1);
        let pad_top = (rows * tile - scaled_height) / 2;
        Ok(Self {
            cols,
            rows,
            tile,
            scaled_width,
            scaled_height,
            pad_top,
        })
    }

    fn tiles(&self) -> usize {
        (self.cols as usize) * (self.rows as usize)
    }
}

fn tile_filter(plan: &GridPlan, row: u32, col: u32) -> String {
    let t = plan.tile;
    format!(
        "scale={w}:{h},format=rgba,pad={w}:{ph}:0:{top}:color=0x00000000,crop={t}:{t}:{x}:{y},format=yuva420p",
        w = plan.scaled_width,
        h = plan.scaled_height,
        ph = plan.rows * t,
        top = plan.pad_top,
        x = col * t,
        y = row * t,
    )
}

// ============== Tool runner ==============

struct ToolOutput {
    stdout: String,
    stderr: String,
}

async fn run_tool(program: &Path, args: &[&str]) -> Result<ToolOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let out = match tokio::time::timeout(TOOL_TIMEOUT, cmd.output()).await {
        Ok(out) => out.map_err(|e| {
            Error::External(format!("failed to start {}: {e}", program.display()))
        })?,
        Err(_) => {
            return Err(Error::External(format!(
                "{} timed out after {}s",
                program.display(),
                TOOL_TIMEOUT.as_secs()
            )))
        }
    };

    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    if !out.status.success() {
        let mut msg = format!("{} exited with {}", program.display(), out.status);
        let tail = stderr_tail(&stderr);
        if !tail.trim().is_empty() {
            msg.push_str("\nstderr (tail):\n");
            msg.push_str(&tail);
        }
        return Err(Error::External(msg));
    }

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr,
    })
}

fn stderr_tail(stderr: &str) -> String {
    let mut lines: VecDeque<&str> = VecDeque::new();
    let mut bytes = 0usize;
    for line in stderr.lines() {
        bytes += line.len() + 1;
        lines.push_back(line);
        while lines.len() > STDERR_TAIL_MAX_LINES || bytes > STDERR_TAIL_MAX_BYTES {
            match lines.pop_front() {
                Some(front) => bytes -= front.len() + 1,
                None => break,
            }
        }
    }
    lines.into_iter().collect::<Vec<_>>().join("\n")
}

/// `blackdetect` over the alpha plane found one black segment from the start
/// to (almost) the end of the clip.
fn covers_whole_clip(stderr: &str, duration: f64) -> bool {
    stderr.lines().any(|line| {
        let (Some(start), Some(end)) = (field(line, "black_start:"), field(line, "black_end:"))
        else {
            return false;
        };
        start <= 0.05 && end >= duration - 0.1
    })
}

fn field(line: &str, key: &str) -> Option<f64> {
    let rest = &line[line.find(key)? + key.len()..];
    rest.split_whitespace().next()?.parse().ok()
}
