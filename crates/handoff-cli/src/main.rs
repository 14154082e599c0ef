use clap::{Parser, Subcommand};
use handoff_agent::{
    Availability, FallbackCatalog, FallbackEntry, FallbackResolver, ResolveTarget, ResolvedSlots,
};
use handoff_orchestrator::HandoffConfig;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "handoff", about = "Handoff: background delegation with model fallback")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "handoff.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the fallback slots an agent or category resolves to
    Resolve {
        /// Agent name
        #[arg(short, long, required_unless_present = "category")]
        agent: Option<String>,
        /// Task category (with --agent: the category the agent runs under)
        #[arg(long)]
        category: Option<String>,
        /// Connected providers, comma separated
        #[arg(long, value_delimiter = ',')]
        connected: Vec<String>,
        /// Print the slots as JSON
        #[arg(long)]
        json: bool,
    },
    /// List built-in agents and categories with their chains
    Catalog,
    /// Parse and validate the config file
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Resolve {
            agent,
            category,
            connected,
            json,
        } => {
            let config = load_config(&cli.config, false).await?;
            let resolver = FallbackResolver::new(FallbackCatalog::builtin())
                .with_max_slots(config.max_fallback_slots);
            let availability = Availability::connected(connected);
            let target = match (agent.as_deref(), category.as_deref()) {
                (Some(name), category) => ResolveTarget::Agent { name, category },
                (None, Some(category)) => ResolveTarget::Category(category),
                (None, None) => anyhow::bail!("either --agent or --category is required"),
            };

            let slots = resolver.resolve_slots(target, &config.overrides, &availability)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&slots)?);
            } else {
                print!("{}", format_slots(target.name(), &slots, &availability));
            }
        }
        Commands::Catalog => {
            let catalog = FallbackCatalog::builtin();
            println!("Agents:");
            for name in catalog.agent_names() {
                if let Some(requirement) = catalog.agent(name) {
                    println!("  {name}");
                    print_chain(&requirement.fallback_chain);
                }
            }
            println!("Categories:");
            for name in catalog.category_names() {
                if let Some(requirement) = catalog.category(name) {
                    println!("  {name}");
                    print_chain(&requirement.fallback_chain);
                }
            }
        }
        Commands::CheckConfig => {
            let config = load_config(&cli.config, true).await?;
            println!("Config OK: {}", cli.config.display());
            println!(
                "  agent overrides: {}, category overrides: {}",
                config.overrides.agents.len(),
                config.overrides.categories.len()
            );
            println!(
                "  max slots: {}, transcript cap: {}",
                config.max_fallback_slots, config.transcript_message_cap
            );
            println!(
                "  default concurrency: {}, stuck after {} polls every {} ms",
                config.concurrency.default_limit,
                config.stuck.threshold_polls,
                config.stuck.poll_interval_ms
            );
        }
    }

    Ok(())
}

/// Loads the config file. A missing optional file yields the defaults.
async fn load_config(path: &Path, required: bool) -> anyhow::Result<HandoffConfig> {
    if !required && !path.exists() {
        info!(path = %path.display(), "No config file, using defaults");
        return Ok(HandoffConfig::default());
    }
    HandoffConfig::load(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", path.display(), e))
}

fn print_chain(chain: &[FallbackEntry]) {
    for entry in chain {
        let variant = entry
            .variant
            .as_deref()
            .map(|v| format!(" ({v})"))
            .unwrap_or_default();
        println!("    {}{} via {}", entry.model, variant, entry.providers.join(", "));
    }
}

fn format_slots(name: &str, slots: &ResolvedSlots, availability: &Availability) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{name} ({:?}, {} slots)", slots.source, slots.len());
    if slots.requires_any_model {
        let _ = writeln!(out, "  requires some model: chain kept unfiltered");
    }
    for (i, entry) in slots.entries.iter().enumerate() {
        let selected = entry
            .select_provider(availability)
            .map_or_else(|| "no connected provider".to_string(), |s| s.to_string());
        let _ = writeln!(out, "  {}. {} -> {selected}", i + 1, entry.primary());
    }
    out
}
