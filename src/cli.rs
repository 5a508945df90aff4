//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Fetch, verify and add F-Droid package repositories.
///
/// Repositories are previewed before they are stored: the signed index is
/// downloaded, its certificate is checked against the fingerprint in the
/// address (if any), and the repository and its apps are listed.
#[derive(Parser, Debug)]
#[command(name = "fdroid-repo")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/fdroid-repo/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Repository database (overrides `db_path` from the config file)
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Proxy for all requests, e.g. socks5://127.0.0.1:9050
    #[arg(long, global = true, value_name = "URL")]
    pub proxy: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch and preview a repository, and add it with --yes
    Add(AddArgs),

    /// Add the archive repository of a stored repository
    AddArchive {
        /// Id of the stored repository, as shown by `list`
        repo_id: i64,
    },

    /// List stored repositories
    List,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    /// Repository address, e.g. https://f-droid.org/repo?fingerprint=...
    pub url: String,

    /// Add the repository after a successful preview
    #[arg(short, long)]
    pub yes: bool,

    /// Number of apps to list in the preview
    #[arg(long, default_value_t = 10)]
    pub show_apps: usize,
}
