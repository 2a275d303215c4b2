// CLI module - command-line argument parsing and handlers
//
// The binary runs the proxy by default; subcommands cover operational
// introspection:
// - config --show: print the effective configuration (secrets obfuscated)
// - providers: print the loaded provider catalog

use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};
use crate::providers::ProviderRegistry;
use crate::util::{obfuscate, ObfuscationStyle};

/// llmgate - multi-tenant reverse proxy for LLM provider APIs
#[derive(Parser)]
#[command(name = "llmgate")]
#[command(version = VERSION)]
#[command(about = "Multi-tenant LLM API proxy with withering tokens", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Print the loaded provider catalog
    Providers,
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show }) => {
            if show {
                handle_config_show();
            } else {
                println!("Usage: llmgate config --show");
            }
            true
        }
        Some(Commands::Providers) => {
            handle_providers();
            true
        }
        None => false, // No subcommand, run the proxy
    }
}

fn handle_config_show() {
    match Config::from_env() {
        Ok(config) => {
            println!("llmgate v{VERSION}");
            println!("listen_addr             = {}", config.listen_addr);
            println!(
                "management_token        = {}",
                obfuscate(&config.management_token, ObfuscationStyle::Generic)
            );
            println!("database_path           = {}", config.database_path.display());
            println!(
                "encryption              = {}",
                if config.encryption_key.is_some() { "enabled" } else { "disabled" }
            );
            println!(
                "providers_file          = {}",
                config
                    .providers_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(built-in catalog)".to_string())
            );
            println!("proxy_path_prefix       = {}", config.proxy_path_prefix);
            println!("request_timeout         = {:?}", config.request_timeout);
            println!(
                "max_concurrent_requests = {}",
                config.rate_limit.max_concurrent_requests
            );
            println!(
                "rate_limit_per_minute   = {}",
                config.rate_limit.default_per_minute
            );
            println!("event_bus_capacity      = {}", config.bus.capacity);
            println!("dispatch_batch_size     = {}", config.dispatcher.batch_size);
            println!(
                "dispatch_flush_interval = {:?}",
                config.dispatcher.flush_interval
            );
            println!("dispatch_max_retries    = {}", config.dispatcher.max_retries);
        }
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            std::process::exit(1);
        }
    }
}

fn handle_providers() {
    let path = std::env::var("PROVIDERS_FILE").ok().map(std::path::PathBuf::from);
    match ProviderRegistry::load(path.as_deref()) {
        Ok(registry) => {
            let mut ids = registry.ids();
            ids.sort_unstable();
            for id in ids {
                let profile = registry.get(id).expect("listed id");
                println!("{id}: {} (auth: {})", profile.base_url, profile.auth.header);
            }
        }
        Err(e) => {
            eprintln!("Error loading providers: {e:#}");
            std::process::exit(1);
        }
    }
}
