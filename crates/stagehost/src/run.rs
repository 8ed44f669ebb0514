use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use modelpack::discover_models;
use stage::{ErrorCode, Notification, StageHandle, StageRuntime, StageSettings, SurfaceRef};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::cli::RunArgs;
use crate::headless::HeadlessEngine;
use crate::paths::AppPaths;

const LOAD_TIMEOUT: Duration = Duration::from_secs(5);
const SURFACE_ID: u64 = 1;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run(args: RunArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let settings = load_settings(args.config.as_deref(), &paths.settings_file())?;
    let model = resolve_model(args.model.as_deref(), &paths.model_roots())?;
    debug!(
        config = %paths.config_dir().display(),
        data = %paths.data_dir().display(),
        model = %model,
        "resolved stagehost inputs"
    );

    drive(settings, &model, &args, |notification| {
        println!("{}", describe(notification));
    })
}

/// Runs one stage session against the headless engine and hands every
/// notification to `report` as it arrives.
pub fn drive(
    settings: StageSettings,
    model: &str,
    args: &RunArgs,
    mut report: impl FnMut(&Notification),
) -> Result<()> {
    let runtime = StageRuntime::spawn(settings, HeadlessEngine::factory())?;
    let handle = runtime.handle();
    let (width, height) = args.size;

    handle.surface_created()?;
    handle.start(SurfaceRef::new(SURFACE_ID, width, height))?;
    handle.load_model(model)?;
    wait_for_load(runtime.notifications(), &mut report)?;
    apply_args(&handle, args)?;

    let started = Instant::now();
    let deadline = started + args.duration;
    let mut context_loss = args
        .simulate_context_loss
        .then(|| started + args.duration / 2);

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if context_loss.is_some_and(|at| now >= at) {
            info!("simulating graphics context loss");
            handle.surface_lost()?;
            handle.surface_created()?;
            context_loss = None;
        }

        let wake = context_loss.map_or(deadline, |at| at.min(deadline));
        match runtime
            .notifications()
            .recv_timeout(wake.saturating_duration_since(now))
        {
            Ok(notification) => report(&notification),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("render thread stopped unexpectedly"),
        }
    }

    handle.stop()?;
    runtime.shutdown()?;
    Ok(())
}

fn wait_for_load(
    notifications: &Receiver<Notification>,
    report: &mut impl FnMut(&Notification),
) -> Result<()> {
    let deadline = Instant::now() + LOAD_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let notification = notifications.recv_timeout(remaining).map_err(|err| match err {
            RecvTimeoutError::Timeout => anyhow!(
                "model did not finish loading within {}",
                humantime::format_duration(LOAD_TIMEOUT)
            ),
            RecvTimeoutError::Disconnected => anyhow!("render thread stopped while loading"),
        })?;
        report(&notification);

        match &notification {
            Notification::ModelLoaded { .. } => return Ok(()),
            Notification::Error { code, message }
                if matches!(
                    code,
                    ErrorCode::FileNotFound | ErrorCode::ModelLoadFailed | ErrorCode::GlInitError
                ) =>
            {
                bail!("{code}: {message}");
            }
            _ => {}
        }
    }
}

fn apply_args(handle: &StageHandle, args: &RunArgs) -> Result<()> {
    if let Some(scale) = args.scale {
        handle.set_scale(scale)?;
    }
    if let Some((x, y)) = args.position {
        handle.set_position(x, y)?;
    }
    if let Some(expression) = &args.expression {
        handle.set_expression(expression)?;
    }
    for (group, index) in &args.motions {
        handle.start_motion(group, *index)?;
    }
    if let Some(value) = args.mouth {
        handle.set_mouth_value(value)?;
    }
    if let Some((x, y)) = args.tap {
        handle.touch_began(x, y)?;
        handle.touch_ended(x, y)?;
    }
    Ok(())
}

pub fn describe(notification: &Notification) -> String {
    match notification {
        Notification::ModelLoaded { path } => format!("loaded   {}", path.display()),
        Notification::Error { code, message } => format!("error    {code}: {message}"),
        Notification::Tap { x, y } => format!("tap      ({x:.1}, {y:.1})"),
        Notification::MotionFinished { group, index } => format!("finished {group}#{index}"),
    }
}

/// Reads `explicit` when given, else `default_file` when it exists, else the
/// built-in defaults.
pub fn load_settings(explicit: Option<&Path>, default_file: &Path) -> Result<StageSettings> {
    let path = match explicit {
        Some(path) => path,
        None if default_file.is_file() => default_file,
        None => {
            debug!(path = %default_file.display(), "no settings file; using defaults");
            return Ok(StageSettings::default());
        }
    };

    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings {}", path.display()))?;
    let settings = StageSettings::from_toml_str(&text)
        .with_context(|| format!("failed to load settings {}", path.display()))?;
    info!(path = %path.display(), "settings loaded");
    Ok(settings)
}

/// The model named on the command line, or the first one found below `roots`.
pub fn resolve_model(explicit: Option<&str>, roots: &[PathBuf]) -> Result<String> {
    if let Some(model) = explicit {
        return Ok(model.to_string());
    }

    for root in roots.iter().filter(|root| root.is_dir()) {
        let found = discover_models(root)
            .with_context(|| format!("failed to scan {}", root.display()))?;
        if let Some(first) = found.into_iter().next() {
            info!(model = %first.display(), "using first discovered model");
            return Ok(first.display().to_string());
        }
    }

    let searched: Vec<String> = roots.iter().map(|root| root.display().to_string()).collect();
    bail!("no model given and none found under {}", searched.join(", "))
}
