use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "stagehost",
    author,
    version,
    about = "Drive a model stage from the command line",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Model description path or `file://` URI. Defaults to the first model
    /// found under the model search roots.
    #[arg(value_name = "MODEL")]
    pub model: Option<String>,

    /// Stage settings file; falls back to `stage.toml` in the config directory.
    #[arg(long, value_name = "FILE", env = "STAGEHOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Surface size to report to the stage (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size, default_value = "1280x720")]
    pub size: (u32, u32),

    /// Model scale, clamped to the configured range.
    #[arg(long, value_name = "SCALE")]
    pub scale: Option<f32>,

    /// Model offset in view units (e.g. `0.1,-0.2`).
    #[arg(long, value_name = "X,Y", value_parser = parse_point, allow_hyphen_values = true)]
    pub position: Option<(f32, f32)>,

    /// Expression to apply once the model is loaded.
    #[arg(long, value_name = "ID")]
    pub expression: Option<String>,

    /// Motion to queue, as `Group:index`; may be repeated.
    #[arg(long = "motion", value_name = "GROUP:INDEX", value_parser = parse_motion)]
    pub motions: Vec<(String, usize)>,

    /// Simulate a tap at surface pixel coordinates (e.g. `640,200`).
    #[arg(long, value_name = "X,Y", value_parser = parse_point, allow_hyphen_values = true)]
    pub tap: Option<(f32, f32)>,

    /// Mouth-open value for lip sync (0.0-1.0).
    #[arg(long, value_name = "VALUE")]
    pub mouth: Option<f32>,

    /// Drop and recreate the graphics context midway through the run.
    #[arg(long)]
    pub simulate_context_loss: bool,

    /// How long to keep the stage running (e.g. `3s`, `500ms`).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "3s")]
    pub duration: Duration,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List model descriptions below a directory or the model search roots.
    Models {
        #[arg(value_name = "DIR")]
        root: Option<PathBuf>,
    },
    /// Print the motions, expressions and hit areas a model declares.
    Inspect {
        #[arg(value_name = "MODEL")]
        model: String,
    },
    /// Print resolved config and data directories.
    Where,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("size '{value}' must look like WIDTHxHEIGHT"))?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width '{width}'"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height '{height}'"))?;
    if width == 0 || height == 0 {
        return Err("size must be non-zero".to_string());
    }
    Ok((width, height))
}

pub fn parse_point(value: &str) -> Result<(f32, f32), String> {
    let (x, y) = value
        .trim()
        .split_once(',')
        .ok_or_else(|| format!("point '{value}' must look like X,Y"))?;
    let parse = |raw: &str| {
        raw.trim()
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("invalid coordinate '{}'", raw.trim()))
    };
    Ok((parse(x)?, parse(y)?))
}

pub fn parse_motion(value: &str) -> Result<(String, usize), String> {
    let (group, index) = value
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| format!("motion '{value}' must look like GROUP:INDEX"))?;
    if group.is_empty() {
        return Err("motion group must not be empty".to_string());
    }
    let index = index
        .parse()
        .map_err(|_| format!("invalid motion index '{index}'"))?;
    Ok((group.to_string(), index))
}

pub fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value.trim())
        .map_err(|err| format!("invalid duration '{value}': {err}"))
}
