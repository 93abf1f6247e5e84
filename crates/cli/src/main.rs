use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::{Term, style};
use loadstone_core::{
  CollectingReporter, GraphKey, GraphValue, Loader, MemoEngine, Package, PackageId, PkgPath, Root,
  Severity,
};
use loadstone_lua::scan::scan_pkg_source;
use tracing_subscriber::EnvFilter;

/// loadstone - incremental package loading for Lua-described builds
#[derive(Parser)]
#[command(name = "loadstone")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Load a package and print its targets
  Load {
    /// Package to load, e.g. //app or app/server
    package: String,

    /// Workspace root directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
  },

  /// Print what the scanner extracts from one description file
  Scan {
    /// Path to a PKG.lua file
    file: PathBuf,
  },
}

fn main() -> Result<ExitCode> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();
  match cli.command {
    Commands::Load { package, workspace } => cmd_load(&package, &workspace, cli.verbose),
    Commands::Scan { file } => cmd_scan(&file),
  }
}

fn parse_package_arg(arg: &str) -> Result<PackageId> {
  let path = arg.strip_prefix("//").unwrap_or(arg);
  let path = PkgPath::new(path).map_err(|message| anyhow::anyhow!(message))?;
  Ok(PackageId::in_main(path))
}

fn cmd_load(package: &str, workspace: &PathBuf, verbose: bool) -> Result<ExitCode> {
  let term = Term::stderr();
  let workspace = workspace
    .canonicalize()
    .with_context(|| format!("workspace directory '{}' not found", workspace.display()))?;

  let id = parse_package_arg(package)?;
  let loader = Loader::new(Root::new(workspace)).with_progress(verbose);
  let mut engine = MemoEngine::new(Box::new(loader));
  let mut reporter = CollectingReporter::default();

  let result = engine.evaluate(&GraphKey::Package(id.clone()), &mut reporter);
  print_events(&term, &reporter, verbose)?;

  let value = match result {
    Ok(value) => value,
    Err(error) => {
      term.write_line(&format!("{} {}", style("error:").red().bold(), error))?;
      return Ok(ExitCode::FAILURE);
    }
  };
  let GraphValue::Package(package) = value else {
    bail!("the graph returned a non-package value");
  };

  print_package(&package)?;
  if package.contains_errors {
    term.write_line(&format!(
      "{} package {} contains errors",
      style("error:").red().bold(),
      package.id
    ))?;
    return Ok(ExitCode::FAILURE);
  }
  Ok(ExitCode::SUCCESS)
}

fn print_events(term: &Term, reporter: &CollectingReporter, verbose: bool) -> Result<()> {
  for event in &reporter.events {
    match event.severity {
      Severity::Error => {
        let location = match &event.location {
          Some((file, loc)) => format!("{}:{}: ", file, loc),
          None => String::new(),
        };
        term.write_line(&format!(
          "{} {}{}",
          style("error:").red().bold(),
          location,
          event.message
        ))?;
      }
      Severity::Warning => {
        term.write_line(&format!("{} {}", style("warning:").yellow().bold(), event.message))?;
      }
      Severity::Progress | Severity::Debug => {
        if verbose {
          term.write_line(&event.message)?;
        }
      }
    }
  }
  Ok(())
}

fn print_package(package: &Package) -> Result<()> {
  println!(
    "{} ({} target{})",
    style(&package.id).bold(),
    package.targets.len(),
    if package.targets.len() == 1 { "" } else { "s" }
  );
  for (label, target) in &package.targets {
    println!("  {} {}", style(&target.kind).cyan(), label);
  }
  Ok(())
}

fn cmd_scan(file: &PathBuf) -> Result<ExitCode> {
  let term = Term::stderr();
  let source =
    std::fs::read_to_string(file).with_context(|| format!("cannot read '{}'", file.display()))?;
  let name = file.to_string_lossy();

  match scan_pkg_source(&name, &source) {
    Ok(info) => {
      print_set("globs", info.globs.iter());
      print_set("globs_with_dirs", info.globs_with_dirs.iter());
      print_set("subpackages", info.subpackages.iter());
      print_set("imports", info.imports.iter().map(|i| &i.path));
      println!("annotations:");
      for (location, callee) in &info.annotations {
        println!("  {} {}", location, callee);
      }
      Ok(ExitCode::SUCCESS)
    }
    Err(errors) => {
      for error in errors {
        term.write_line(&format!("{} {}", style("error:").red().bold(), error))?;
      }
      Ok(ExitCode::FAILURE)
    }
  }
}

fn print_set<'a>(name: &str, items: impl Iterator<Item = &'a String>) {
  println!("{}:", name);
  for item in items {
    println!("  {}", item);
  }
}
