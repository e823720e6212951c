//! # Tessera - Catalog Processing Engine
//!
//! The main binary for the Tessera entity catalog.
//!
//! This application provides:
//! - The processing engine (providers, processors, stitching)
//! - CLI interface for catalog operations
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and a default tessera.toml
//! tessera init
//!
//! # Run the engine until Ctrl+C
//! tessera run
//!
//! # One-shot operations
//! tessera apply --source manual --file catalog.yaml
//! tessera process --rounds 10
//! tessera get component:default/web
//! ```

use clap::Parser;
use tessera::cli;
use tessera::logging::{self, LogFormat};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // TESSERA_LOG_FORMAT=json enables machine-parseable output.
    logging::init(LogFormat::from_env());

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the Tessera startup banner.
fn print_banner() {
    println!(
        r#"
  ████████╗███████╗███████╗███████╗███████╗██████╗  █████╗
  ╚══██╔══╝██╔════╝██╔════╝██╔════╝██╔════╝██╔══██╗██╔══██╗
     ██║   █████╗  ███████╗███████╗█████╗  ██████╔╝███████║
     ██║   ██╔══╝  ╚════██║╚════██║██╔══╝  ██╔══██╗██╔══██║
     ██║   ███████╗███████║███████║███████╗██║  ██║██║  ██║
     ╚═╝   ╚══════╝╚══════╝╚══════╝╚══════╝╚═╝  ╚═╝╚═╝  ╚═╝

  Catalog Processing Engine v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
