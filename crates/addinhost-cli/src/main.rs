//! Addinhost CLI - inspect, validate and run plugin directories

use addinhost_core::config::HostConfig;
use addinhost_plugins::validation::{SignatureRule, assembly_digest, signature_path};
use addinhost_plugins::{
    AdminCommand, CommandResult, DependencyGraph, DiscoveryReport, LoadReport,
    PluginAdministrator, PluginDescriptor, PluginDiscovery, PluginHost, PluginInfo,
    PluginValidator, ValidationResult,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const RECLAIM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "addinhost")]
#[command(author, version, about = "Discover, validate and run addinhost plugins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugin manifests under a directory
    Discover {
        /// Plugin root (defaults to plugins.directory)
        dir: Option<PathBuf>,
    },

    /// Run the validation rules over every discovered plugin
    Validate {
        /// Plugin root (defaults to plugins.directory)
        dir: Option<PathBuf>,
    },

    /// Print the dependency load order
    Order {
        /// Plugin root (defaults to plugins.directory)
        dir: Option<PathBuf>,
    },

    /// Print the sha256 digest of an assembly
    Digest {
        assembly: PathBuf,
        /// Write the digest to the `<assembly>.sig` sidecar
        #[arg(short, long)]
        write: bool,
    },

    /// Load every plugin, optionally run an admin script, then shut down
    Run {
        /// Plugin root (defaults to plugins.directory)
        dir: Option<PathBuf>,
        /// JSON array of admin commands to execute after loading
        #[arg(short, long)]
        script: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
    /// Reset to defaults
    Reset,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("addinhost=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => cmd_config(action, cli.quiet),

        Commands::Digest { assembly, write } => cmd_digest(&assembly, write, cli.quiet).await,

        Commands::Discover { dir } => {
            let config = HostConfig::load()?;
            cmd_discover(&config, dir, cli.format, cli.quiet).await
        }

        Commands::Validate { dir } => {
            let config = HostConfig::load()?;
            cmd_validate(&config, dir, cli.format, cli.quiet).await
        }

        Commands::Order { dir } => {
            let config = HostConfig::load()?;
            cmd_order(&config, dir, cli.format).await
        }

        Commands::Run { dir, script } => {
            let config = HostConfig::load()?;
            cmd_run(config, dir, script.as_deref(), cli.format, cli.quiet).await
        }
    }
}

fn resolve_root(config: &HostConfig, dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => config.plugins.plugin_dir(),
    }
}

async fn discover(config: &HostConfig, dir: Option<PathBuf>) -> anyhow::Result<DiscoveryReport> {
    let root = resolve_root(config, dir)?;
    info!(root = %root.display(), "Discovering plugins");
    Ok(PluginDiscovery::new().discover(&root).await)
}

fn descriptor_json(descriptor: &PluginDescriptor) -> Value {
    let dependencies: Vec<Value> = descriptor
        .dependencies
        .iter()
        .map(|dep| {
            json!({
                "id": dep.plugin_id,
                "range": dep.version_range.to_string(),
                "optional": dep.is_optional,
            })
        })
        .collect();

    json!({
        "id": descriptor.id,
        "name": descriptor.name,
        "version": descriptor.version_label(),
        "assembly": descriptor.assembly_path.display().to_string(),
        "dependencies": dependencies,
        "permissions": descriptor.permissions.names(),
    })
}

fn failures_json(report: &DiscoveryReport) -> Vec<Value> {
    report
        .failures
        .iter()
        .map(|failure| {
            json!({
                "path": failure.path.display().to_string(),
                "error": failure.error,
            })
        })
        .collect()
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_discover(
    config: &HostConfig,
    dir: Option<PathBuf>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let report = discover(config, dir).await?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "plugins": report.descriptors.iter().map(descriptor_json).collect::<Vec<_>>(),
            "failures": failures_json(&report),
        })),
        OutputFormat::Text => {
            if report.descriptors.is_empty() && report.failures.is_empty() && !quiet {
                println!("No plugins found.");
            }
            for descriptor in &report.descriptors {
                println!(
                    "{} {} ({})",
                    descriptor.id,
                    descriptor.version_label(),
                    descriptor.assembly_path.display()
                );
                if !quiet {
                    for dep in &descriptor.dependencies {
                        let marker = if dep.is_optional { " (optional)" } else { "" };
                        println!("  requires {} {}{}", dep.plugin_id, dep.version_range, marker);
                    }
                }
            }
            for failure in &report.failures {
                println!("[FAIL] {}: {}", failure.path.display(), failure.error);
            }
            Ok(())
        }
    }
}

async fn cmd_validate(
    config: &HostConfig,
    dir: Option<PathBuf>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let report = discover(config, dir).await?;
    let signature = SignatureRule::from_config(&config.plugins)?;
    let validator = PluginValidator::standard(report.descriptors.clone(), signature);

    let mut results: Vec<(&PluginDescriptor, ValidationResult)> = Vec::new();
    for descriptor in &report.descriptors {
        results.push((descriptor, validator.validate(descriptor).await));
    }
    let invalid = results.iter().filter(|(_, result)| !result.is_valid).count()
        + report.failures.len();

    match format {
        OutputFormat::Json => print_json(&json!({
            "plugins": results
                .iter()
                .map(|(descriptor, result)| json!({
                    "id": descriptor.id,
                    "valid": result.is_valid,
                    "errors": result.errors,
                }))
                .collect::<Vec<_>>(),
            "failures": failures_json(&report),
        }))?,
        OutputFormat::Text => {
            for (descriptor, result) in &results {
                if result.is_valid {
                    if !quiet {
                        println!("[OK] {}", descriptor.id);
                    }
                } else {
                    println!("[FAIL] {}: {}", descriptor.id, result.errors.join("; "));
                }
            }
            for failure in &report.failures {
                println!("[FAIL] {}: {}", failure.path.display(), failure.error);
            }
            if invalid == 0 && !quiet {
                println!("All {} plugin(s) valid.", results.len());
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} plugin(s) failed validation");
    }
    Ok(())
}

async fn cmd_order(
    config: &HostConfig,
    dir: Option<PathBuf>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let report = discover(config, dir).await?;
    for failure in &report.failures {
        warn!(path = %failure.path.display(), error = %failure.error, "Skipping manifest");
    }

    let mut graph = DependencyGraph::new();
    for descriptor in report.descriptors {
        graph.add_plugin(descriptor);
    }
    let order = graph.topological_sort()?;

    match format {
        OutputFormat::Json => print_json(&json!({ "order": order })),
        OutputFormat::Text => {
            for (position, id) in order.iter().enumerate() {
                println!("{}. {}", position + 1, id);
            }
            Ok(())
        }
    }
}

async fn cmd_digest(assembly: &Path, write: bool, quiet: bool) -> anyhow::Result<()> {
    let digest = hex::encode(assembly_digest(assembly).await?);

    if write {
        let sidecar = signature_path(assembly);
        tokio::fs::write(&sidecar, &digest)
            .await
            .with_context(|| format!("Failed to write {}", sidecar.display()))?;
        if !quiet {
            println!("Wrote {}", sidecar.display());
        }
    } else {
        println!("{digest}");
    }
    Ok(())
}

async fn cmd_run(
    config: HostConfig,
    dir: Option<PathBuf>,
    script: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let root = resolve_root(&config, dir)?;
    let commands: Vec<AdminCommand> = match script {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid admin script {}", path.display()))?
        }
        None => Vec::new(),
    };

    let host = PluginHost::new(config)?;
    let report = host.discover_and_load(&root).await?;
    let results = host.execute_script(commands).await;
    let plugins = host.list_plugins();

    match format {
        OutputFormat::Json => print_json(&json!({
            "loaded": report.loaded,
            "failed": report
                .failed
                .iter()
                .map(|(id, errors)| json!({ "id": id, "errors": errors }))
                .collect::<Vec<_>>(),
            "discovery_failures": report
                .discovery_failures
                .iter()
                .map(|failure| json!({
                    "path": failure.path.display().to_string(),
                    "error": failure.error,
                }))
                .collect::<Vec<_>>(),
            "commands": serde_json::to_value(&results)?,
            "plugins": serde_json::to_value(&plugins)?,
        }))?,
        OutputFormat::Text => print_run(&report, &results, &plugins, quiet),
    }

    for handle in host.shutdown().await {
        if !handle.wait_for_reclaim(RECLAIM_TIMEOUT).await {
            warn!(
                assembly = %handle.assembly_path().display(),
                "Assembly still referenced after shutdown"
            );
        }
    }
    Ok(())
}

fn print_run(report: &LoadReport, results: &[CommandResult], plugins: &[PluginInfo], quiet: bool) {
    if !quiet {
        println!("Loaded {} plugin(s).", report.loaded.len());
    }
    for (id, errors) in &report.failed {
        println!("[FAIL] {}: {}", id, errors.join("; "));
    }
    for failure in &report.discovery_failures {
        println!("[FAIL] {}: {}", failure.path.display(), failure.error);
    }

    for result in results {
        match &result.error {
            None => println!("[OK] {}", result.message),
            Some(error) => println!("[FAIL] {}: {}", result.message, error),
        }
    }

    if quiet {
        return;
    }
    for plugin in plugins {
        let enabled = if plugin.enabled { "enabled" } else { "disabled" };
        println!(
            "{} {} {} {}",
            plugin.id,
            plugin.version,
            plugin.state.as_str(),
            enabled
        );
    }
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = HostConfig::load()?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = HostConfig::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = HostConfig::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            HostConfig::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            println!("{}", HostConfig::config_path()?.display());
        }
    }
    Ok(())
}
