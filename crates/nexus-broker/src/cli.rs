use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nexus-broker")]
#[command(about = "NEXUS broker: register MCP tool servers, build the capability graph, discover and run pipelines.")]
pub(crate) struct Cli {
    /// Path to the broker database.
    #[arg(long, global = true, default_value = "data/nexus.db")]
    pub(crate) db: PathBuf,

    /// Path to the settings file (missing file means defaults).
    #[arg(long, global = true, default_value = "nexus.json")]
    pub(crate) config: PathBuf,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the HTTP gateway. Default bind: 0.0.0.0:8600
    Gateway {
        /// Listen address (e.g. 0.0.0.0:8600)
        #[arg(long, default_value = "0.0.0.0:8600")]
        bind: String,
    },
    /// Register a tool server: connect, list operations, profile, persist.
    Register {
        /// Server name (e.g. web-fetcher)
        #[arg(long)]
        name: String,

        /// Launch command (e.g. uv)
        #[arg(long)]
        command: String,

        /// Re-register even when the server is cached.
        #[arg(long)]
        force: bool,

        /// Arguments for the launch command (everything after --).
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Remove a server and every edge touching it.
    Unregister {
        /// Server name.
        #[arg(long)]
        name: String,
    },
    /// Build or extend the capability graph over all registered servers.
    Rebuild {
        /// Clear stored edges first instead of extending incrementally.
        #[arg(long)]
        full: bool,
    },
    /// Plan a pipeline for a request without executing it.
    Discover {
        /// Natural-language request.
        #[arg(long)]
        request: String,
    },
    /// Discover and execute a pipeline.
    Run {
        /// Natural-language request.
        #[arg(long)]
        request: String,

        /// URL to fetch (extracted from the request text when omitted).
        #[arg(long)]
        url: Option<String>,

        /// Delivery channel (default: #team-updates).
        #[arg(long)]
        channel: Option<String>,

        /// Source language for translation steps.
        #[arg(long)]
        source_language: Option<String>,

        /// Target language for translation steps.
        #[arg(long)]
        target_language: Option<String>,
    },
    /// Print storage statistics.
    Status,
    /// Print recent pipeline runs.
    History {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}
