mod cli;
mod headless;
mod paths;
mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use cli::Command;
use modelpack::{discover_models, ModelPack, ModelSource};
use paths::AppPaths;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::Models { root }) => run_models(root),
        Some(Command::Inspect { model }) => run_inspect(&model),
        Some(Command::Where) => run_where(),
        None => run::run(cli.run),
    }
}

fn run_models(root: Option<PathBuf>) -> Result<()> {
    let roots = match root {
        Some(root) => vec![root],
        None => AppPaths::discover()?.model_roots(),
    };

    let mut total = 0;
    for root in &roots {
        if !root.is_dir() {
            println!("{} (missing)", root.display());
            continue;
        }
        let models = discover_models(root)
            .with_context(|| format!("failed to scan {}", root.display()))?;
        println!("{}:", root.display());
        for model in &models {
            println!("  {}", model.display());
        }
        total += models.len();
    }

    if total == 0 {
        println!("No models found.");
    }
    Ok(())
}

fn run_inspect(model: &str) -> Result<()> {
    let source = ModelSource::from_input(model);
    let pack = ModelPack::load(source.path())
        .with_context(|| format!("failed to load {}", source.path().display()))?;

    println!("Model: {}", pack.manifest_path().display());
    println!("Textures:");
    for (slot, path) in pack.texture_paths() {
        let status = if path.is_file() { "ok" } else { "missing" };
        println!("  {slot:<3} {status:<8} {}", path.display());
    }
    println!("Motions:");
    for (group, count) in pack.available_motions() {
        println!("  {group:<16} {count}");
    }
    println!("Expressions:");
    for id in pack.available_expressions() {
        println!("  {id}");
    }
    println!("Hit areas:");
    for area in &pack.manifest().hit_areas {
        println!("  {:<16} {}", area.name, area.id);
    }
    Ok(())
}

fn run_where() -> Result<()> {
    let paths = AppPaths::discover()?;
    println!("Configuration directories:");
    println!("  config:     {}", paths.config_dir().display());
    println!("  data:       {}", paths.data_dir().display());
    println!("  settings:   {}", paths.settings_file().display());
    println!("Model search roots:");
    for root in paths.model_roots() {
        println!("  {}", root.display());
    }
    Ok(())
}
