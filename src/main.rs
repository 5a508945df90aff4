//! CLI entry point for the fdroid-repo tool.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fdroid_repo::Database;
use fdroid_repo::download::{
    HttpManager, HttpSettings, InMemoryMirrorParameters, MirrorChooser, MirrorChooserRandom,
    MirrorChooserWithParameters, ProgressListener, ProxyConfig,
};
use fdroid_repo::index::DEFAULT_LOCALE;
use fdroid_repo::repo::{
    AddRepoState, FetchResult, FetchingState, RepoAdder, RepoStore, RepoV1Fetcher, RepoV2Fetcher,
    StaticUnknownSourcesPolicy,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

mod cli;
mod config;

use cli::{AddArgs, Cli, Command};
use config::{FileConfig, MirrorStrategy};

/// Everything the subcommands need, resolved from flags and the config file.
struct RunContext {
    store: RepoStore,
    http: Arc<HttpManager>,
    temp_dir: PathBuf,
    locale: String,
    proxy: Option<ProxyConfig>,
    disallow_unknown_sources: bool,
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(?cli, "CLI arguments parsed");

    let file_config = config::load_config(cli.config.as_deref())?;
    let context = build_context(&cli, &file_config).await?;

    match &cli.command {
        Command::Add(args) => run_add(&context, args).await,
        Command::AddArchive { repo_id } => run_add_archive(&context, *repo_id).await,
        Command::List => run_list(&context).await,
    }
}

async fn build_context(cli: &Cli, file_config: &FileConfig) -> Result<RunContext> {
    let proxy = cli
        .proxy
        .as_deref()
        .or(file_config.proxy.as_deref())
        .map(str::parse::<ProxyConfig>)
        .transpose()
        .context("Invalid proxy")?;

    let defaults = HttpSettings::default();
    let settings = HttpSettings {
        connect_timeout: file_config
            .connect_timeout_secs
            .map_or(defaults.connect_timeout, Duration::from_secs),
        read_timeout: file_config
            .read_timeout_secs
            .map_or(defaults.read_timeout, Duration::from_secs),
        onion_connect_timeout: file_config
            .onion_connect_timeout_secs
            .map_or(defaults.onion_connect_timeout, Duration::from_secs),
        high_timeouts: file_config.high_timeouts.unwrap_or(false),
        ..defaults
    };
    let chooser: Arc<dyn MirrorChooser> = match file_config.mirror_strategy() {
        MirrorStrategy::Random => Arc::new(MirrorChooserRandom::new()),
        MirrorStrategy::Parameters => Arc::new(MirrorChooserWithParameters::new(
            InMemoryMirrorParameters::new(
                file_config.prefer_foreign_mirrors.unwrap_or(false),
                file_config
                    .current_location
                    .as_ref()
                    .map(|code| code.to_ascii_uppercase()),
            ),
        )),
    };
    let http = Arc::new(HttpManager::new(settings, chooser)?);

    let db_path = cli
        .db
        .clone()
        .or_else(|| file_config.db_path.clone())
        .unwrap_or_else(config::resolve_default_db_path);
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("Failed to open database '{}'", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");

    Ok(RunContext {
        store: RepoStore::new(db),
        http,
        temp_dir: file_config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir),
        locale: file_config
            .locale
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
        proxy,
        disallow_unknown_sources: file_config.disallow_unknown_sources.unwrap_or(false),
        quiet: cli.quiet,
    })
}

impl RunContext {
    fn adder(&self, progress: Option<ProgressListener>) -> RepoAdder {
        let v2 = RepoV2Fetcher::new(Arc::clone(&self.http), self.temp_dir.clone(), &*self.locale)
            .with_progress(progress.clone());
        let v1 = RepoV1Fetcher::new(Arc::clone(&self.http), self.temp_dir.clone(), &*self.locale)
            .with_progress(progress);
        let policy = if self.disallow_unknown_sources {
            StaticUnknownSourcesPolicy::disallowed()
        } else {
            StaticUnknownSourcesPolicy::allowed()
        };
        RepoAdder::new(self.store.clone(), Arc::new(v2), Arc::new(v1), Arc::new(policy))
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

async fn run_add(context: &RunContext, args: &AddArgs) -> Result<ExitCode> {
    let bar = progress_bar(context.quiet);
    bar.set_message("Fetching repository");
    let listener_bar = bar.clone();
    let listener: ProgressListener = Arc::new(move |bytes: u64, total: Option<u64>| {
        if let Some(total) = total {
            listener_bar.set_length(total);
        }
        listener_bar.set_position(bytes);
    });
    let adder = context.adder(Some(listener));

    adder.fetch_repository(&args.url, context.proxy.clone());
    let state = adder.wait_for_fetch().await;
    bar.finish_and_clear();

    let fetching = match &state {
        AddRepoState::Fetching(fetching) => fetching,
        AddRepoState::Error { kind, cause } => {
            let detail = cause.as_ref().map(ToString::to_string).unwrap_or_default();
            eprintln!("Error: {kind}: {detail}");
            return Ok(ExitCode::FAILURE);
        }
        other => bail!("Unexpected state after fetching: {other:?}"),
    };
    print_preview(fetching, &context.locale, args.show_apps);

    if matches!(
        fetching.fetch_result,
        Some(FetchResult::IsExistingRepository { .. })
    ) {
        println!("Repository is already added.");
        return Ok(ExitCode::SUCCESS);
    }
    if !args.yes {
        println!("Run again with --yes to add it.");
        return Ok(ExitCode::SUCCESS);
    }

    match adder.add_fetched_repository().await {
        AddRepoState::Added {
            repo,
            update_result,
        } => {
            println!("Added repository {} (id {})", repo.address, repo.repo_id);
            if let Some(result) = update_result {
                println!("Index: {result:?}");
            }
            Ok(ExitCode::SUCCESS)
        }
        AddRepoState::Error { kind, cause } => {
            let detail = cause.as_ref().map(ToString::to_string).unwrap_or_default();
            eprintln!("Error: {kind}: {detail}");
            Ok(ExitCode::FAILURE)
        }
        other => bail!("Unexpected state after adding: {other:?}"),
    }
}

fn print_preview(fetching: &FetchingState, locale: &str, show_apps: usize) {
    let Some(repo) = &fetching.repo else {
        return;
    };
    println!("Name:        {}", repo.name(locale).unwrap_or("(unnamed)"));
    println!("Address:     {}", repo.address);
    println!(
        "Fingerprint: {}",
        repo.fingerprint().unwrap_or_else(|| "(unknown)".to_string())
    );
    if let Some(format) = repo.format_version {
        println!("Format:      {format}");
    }
    println!("Apps:        {}", fetching.apps.len());
    match &fetching.fetch_result {
        Some(FetchResult::IsNewRepository { .. }) => println!("Result:      new repository"),
        Some(FetchResult::IsNewMirror {
            existing_repo_id,
            new_mirror_url,
        }) => println!("Result:      new mirror {new_mirror_url} of repository {existing_repo_id}"),
        Some(FetchResult::IsExistingRepository { existing_repo_id }) => {
            println!("Result:      already added as repository {existing_repo_id}");
        }
        None => {}
    }
    for app in fetching.apps.iter().take(show_apps) {
        println!(
            "  {} {}",
            app.package_name,
            app.name.as_deref().unwrap_or_default()
        );
    }
}

async fn run_add_archive(context: &RunContext, repo_id: i64) -> Result<ExitCode> {
    let Some(repo) = context.store.get_repository(repo_id).await? else {
        eprintln!("Error: no repository with id {repo_id}");
        return Ok(ExitCode::FAILURE);
    };
    let adder = context.adder(None);
    match adder.add_archive_repo(&repo, context.proxy.clone()).await {
        Ok(Some(archive_id)) => {
            println!("Added archive {} (id {archive_id})", repo.archive_address());
            Ok(ExitCode::SUCCESS)
        }
        Ok(None) => {
            eprintln!("Error: archive index had no repository");
            Ok(ExitCode::FAILURE)
        }
        Err(error) => {
            eprintln!("Error: {}: {error}", error.kind());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_list(context: &RunContext) -> Result<ExitCode> {
    let repositories = context.store.get_repositories().await?;
    if repositories.is_empty() {
        println!("No repositories.");
    }
    for repo in repositories {
        println!(
            "{:>4}  weight {:>3}  {}  {}",
            repo.repo_id,
            repo.preferences.weight,
            repo.address,
            repo.name(&context.locale).unwrap_or("(unnamed)")
        );
        for url in repo.official_mirror_urls().iter().skip(1) {
            println!("      mirror {url}");
        }
        for url in &repo.preferences.user_mirrors {
            println!("      user mirror {url}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
