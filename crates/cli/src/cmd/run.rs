use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use argp::FromArgs;
use mod_connect_cache::RepoCache;
use mod_connect_core::{cancel::CancelToken, config::Config, models::DEFAULT_BRANCH};
use mod_connect_ingest::HttpIngestClient;
use mod_connect_pipeline::{DiscoverySource, Pipeline};
use mod_connect_provider::{
    github::GitHubProvider, gitlab::GitLabProvider, static_source::StaticSource,
};
use url::Url;

use crate::util::{parse_path, parse_url};

/// Config file picked up from the working directory when `--config` is not
/// given.
const DEFAULT_CONFIG_FILE: &str = "mod-connect.yml";

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Discover repositories, clone or update them locally, and submit each
/// revision to the ingestion API.
#[argp(subcommand, name = "run")]
pub struct Args {
    #[argp(option, short = 'c', from_str_fn(parse_path))]
    /// path to the YAML configuration file
    config: Option<PathBuf>,
    #[argp(option)]
    /// organization to discover; repeatable, replaces the configured lists
    org: Vec<String>,
    #[argp(option, from_str_fn(parse_url))]
    /// GitHub API base URL, e.g. for GitHub Enterprise Server
    api_url: Option<Url>,
    #[argp(option, from_str_fn(parse_path))]
    /// CSV file with repositories to ingest instead of provider discovery
    from_csv: Option<PathBuf>,
    #[argp(option, from_str_fn(parse_url))]
    /// base SCM URL used to build clone URLs for CSV rows
    scm_url: Option<Url>,
    #[argp(option)]
    /// branch checked out for CSV rows that do not name one
    default_branch: Option<String>,
    #[argp(option, from_str_fn(parse_path))]
    /// directory where working copies are cached
    cache_dir: Option<PathBuf>,
    #[argp(option, from_str_fn(parse_url))]
    /// ingestion API endpoint receiving submission batches
    ingest_url: Option<Url>,
    #[argp(option)]
    /// global ceiling on concurrent tasks
    max_concurrency: Option<usize>,
    #[argp(option)]
    /// ceiling on concurrent tasks per upstream host
    per_host: Option<usize>,
    #[argp(switch)]
    /// print the run report as JSON instead of text
    json: bool,
}

pub async fn run(args: Args) -> Result<u8> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(dir) = &args.cache_dir {
        config.cache.root = dir.clone();
    }
    if let Some(url) = &args.ingest_url {
        config.ingest.url = Some(url.clone());
    }
    if let Some(n) = args.max_concurrency {
        config.limits.max_concurrency = n;
    }
    if let Some(n) = args.per_host {
        config.limits.per_host = n;
    }
    if let Some(url) = &args.api_url {
        if let Some(github) = &mut config.providers.github {
            github.api_url = url.as_str().trim_end_matches('/').to_string();
        }
    }

    let sources = build_sources(&args, &config)?;

    let cache = Arc::new(RepoCache::new(config.cache.root.clone()));
    let ingest_token = std::env::var("MOD_CONNECT_INGEST_TOKEN").ok();
    let sink = Arc::new(HttpIngestClient::new(&config.ingest, ingest_token)?);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping dispatch");
                cancel.cancel();
            }
        });
    }

    let pipeline = Pipeline::new(
        sources,
        cache,
        sink,
        &config.limits,
        config.ingest.batch_size,
        cancel,
    );
    let report = pipeline.execute().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(report.exit_code() as u8)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Config::load(Path::new(DEFAULT_CONFIG_FILE))
        }
        None => Ok(Config::default()),
    }
}

fn build_sources(args: &Args, config: &Config) -> Result<Vec<DiscoverySource>> {
    if let Some(csv_path) = &args.from_csv {
        let contents = std::fs::read_to_string(csv_path)
            .with_context(|| format!("Failed to read {}", csv_path.display()))?;
        let scm_url =
            args.scm_url.clone().unwrap_or_else(|| "https://github.com".parse().unwrap());
        let default_branch = args.default_branch.as_deref().unwrap_or(DEFAULT_BRANCH);
        let source =
            StaticSource::from_csv(&provider_label(&scm_url), &scm_url, default_branch, &contents)
                .with_context(|| format!("Failed to parse {}", csv_path.display()))?;
        if source.is_empty() {
            bail!("{} contains no repositories", csv_path.display());
        }
        tracing::info!("Loaded {} repositories from {}", source.len(), csv_path.display());
        return Ok(vec![DiscoverySource {
            provider: Arc::new(source),
            organizations: vec![String::new()],
        }]);
    }

    let mut sources = Vec::new();
    if let Some(github) = &config.providers.github {
        let token = std::env::var("GITHUB_TOKEN")
            .context("GITHUB_TOKEN must be set to discover GitHub repositories")?;
        let organizations = organizations(&args.org, &github.organizations, "github")?;
        sources.push(DiscoverySource {
            provider: Arc::new(GitHubProvider::new(github, token)?),
            organizations,
        });
    }
    if let Some(gitlab) = &config.providers.gitlab {
        let token = std::env::var("GITLAB_TOKEN")
            .context("GITLAB_TOKEN must be set to discover GitLab repositories")?;
        let organizations = organizations(&args.org, &gitlab.organizations, "gitlab")?;
        sources.push(DiscoverySource {
            provider: Arc::new(GitLabProvider::new(gitlab, token)?),
            organizations,
        });
    }
    if sources.is_empty() {
        bail!(
            "No repository sources: configure providers in {DEFAULT_CONFIG_FILE} or pass --from-csv"
        );
    }
    Ok(sources)
}

fn organizations(flags: &[String], configured: &[String], provider: &str) -> Result<Vec<String>> {
    let organizations = if flags.is_empty() { configured.to_vec() } else { flags.to_vec() };
    if organizations.is_empty() {
        bail!("No organizations configured for {provider}; use --org or the config file");
    }
    Ok(organizations)
}

/// Identity label for CSV-supplied repositories, derived from the SCM host.
fn provider_label(scm_url: &Url) -> String {
    match scm_url.host_str() {
        Some("github.com") => "github".to_string(),
        Some("gitlab.com") => "gitlab".to_string(),
        Some(host) => host.to_string(),
        None => "scm".to_string(),
    }
}
