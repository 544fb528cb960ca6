use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pncp_core::export::ExportRow;
use pncp_core::{Region, SavedSearch, Status};
use pncp_fetch::{FetchConfig, PncpClient};
use pncp_store::{LocalDocumentStore, RemoteDocumentStore, RemoteStoreConfig, SyncedStore};
use pncp_sync::{MarkKind, Reconciler, ToggleOutcome};

#[derive(Debug, Parser)]
#[command(name = "pncp-cli")]
#[command(about = "PNCP edital watch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search the selected regions and print the merged notices.
    Search {
        /// Region as `code:name:uf` (repeatable, already catalog-resolved).
        #[arg(long = "region", required = true)]
        regions: Vec<String>,
        /// Status filter: recebendo_proposta, em_julgamento or encerrado.
        #[arg(long)]
        status: Option<String>,
        /// Local substring filter on title/object.
        #[arg(long, default_value = "")]
        keyword: String,
        /// Write the tabular export rows as JSON to this path.
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Set or clear a review mark for a notice UID.
    Mark {
        uid: String,
        /// reviewed or rejected
        #[arg(long)]
        kind: String,
        /// Clear instead of set.
        #[arg(long)]
        off: bool,
    },
    /// Manage saved searches.
    Saved {
        #[command(subcommand)]
        action: SavedAction,
    },
}

#[derive(Debug, Subcommand)]
enum SavedAction {
    List,
    Save {
        name: String,
        #[arg(long = "region")]
        regions: Vec<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "")]
        keyword: String,
        #[arg(long)]
        state: Option<String>,
    },
    Delete {
        name: String,
    },
}

/// Environment-driven configuration, assembled once at startup.
#[derive(Debug, Clone)]
struct AppConfig {
    search_url: Option<String>,
    user_agent: Option<String>,
    http_timeout_secs: Option<u64>,
    store_token: String,
    store_repo: String,
    store_branch: String,
    store_base_path: String,
    local_state_dir: PathBuf,
}

impl AppConfig {
    fn from_env() -> Self {
        Self {
            search_url: std::env::var("PNCP_SEARCH_URL").ok(),
            user_agent: std::env::var("PNCP_USER_AGENT").ok(),
            http_timeout_secs: std::env::var("PNCP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            store_token: std::env::var("PNCP_STORE_TOKEN").unwrap_or_default(),
            store_repo: std::env::var("PNCP_STORE_REPO").unwrap_or_default(),
            store_branch: std::env::var("PNCP_STORE_BRANCH")
                .unwrap_or_else(|_| "main".to_string()),
            store_base_path: std::env::var("PNCP_STORE_BASE_PATH")
                .unwrap_or_else(|_| "state".to_string()),
            local_state_dir: std::env::var("PNCP_LOCAL_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
        }
    }

    fn fetch_config(&self) -> FetchConfig {
        let mut config = FetchConfig::default();
        if let Some(url) = &self.search_url {
            config.search_url = url.clone();
        }
        if let Some(agent) = &self.user_agent {
            config.user_agent = agent.clone();
        }
        if let Some(secs) = self.http_timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn parse_region(input: &str) -> Result<Region> {
    let mut parts = input.splitn(3, ':');
    let code = parts.next().unwrap_or("").trim();
    if code.is_empty() {
        bail!("region '{input}' has no code; expected code:name:uf");
    }
    Ok(Region {
        code: code.to_string(),
        name: parts.next().unwrap_or(code).trim().to_string(),
        state: parts.next().unwrap_or("").trim().to_string(),
    })
}

fn parse_status(input: Option<&str>) -> Result<Option<Status>> {
    match input {
        None => Ok(None),
        Some(raw) => Status::from_api_value(raw)
            .map(Some)
            .with_context(|| format!("unknown status '{raw}'")),
    }
}

fn parse_kind(input: &str) -> Result<MarkKind> {
    match input {
        "reviewed" => Ok(MarkKind::Reviewed),
        "rejected" => Ok(MarkKind::Rejected),
        other => bail!("unknown mark kind '{other}'; expected reviewed or rejected"),
    }
}

fn build_reconciler(config: &AppConfig) -> Result<Reconciler> {
    let fetch_config = config.fetch_config();
    let client = PncpClient::new(&fetch_config)?;
    let remote = RemoteDocumentStore::new(RemoteStoreConfig::new(
        config.store_token.clone(),
        config.store_repo.clone(),
        config.store_branch.clone(),
        config.store_base_path.clone(),
    ))
    .context("building remote document store")?;
    let local = LocalDocumentStore::new(config.local_state_dir.clone());
    let store = SyncedStore::new(Box::new(remote), local);
    Ok(Reconciler::new(Arc::new(client), store, fetch_config))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let reconciler = build_reconciler(&config)?;

    match cli.command {
        Commands::Search {
            regions,
            status,
            keyword,
            export,
        } => {
            let regions = regions
                .iter()
                .map(|r| parse_region(r))
                .collect::<Result<Vec<_>>>()?;
            let status = parse_status(status.as_deref())?;

            let loaded = reconciler.load_marks().await?;
            if loaded.degraded {
                eprintln!("warning: marks served from local fallback; remote store unreachable");
            }

            let (notices, report) = reconciler.run_search(&regions, status, &keyword).await?;

            for failure in &report.failed {
                eprintln!(
                    "warning: region {} ({}) failed: {}",
                    failure.region.name, failure.region.code, failure.error
                );
            }
            if report.skipped_records > 0 {
                eprintln!("warning: skipped {} malformed records", report.skipped_records);
            }

            for notice in &notices {
                let flags = format!(
                    "[{}{}]",
                    if notice.reviewed { "R" } else { "-" },
                    if notice.rejected { "X" } else { "-" },
                );
                println!(
                    "{flags} {} | {}/{} | {} | {}",
                    pncp_core::export::format_datetime_br(notice.published_at),
                    notice.city,
                    notice.state,
                    notice.title,
                    notice.link,
                );
            }
            println!(
                "{} notices from {} regions ({} skipped, {} failed)",
                notices.len(),
                report.regions.len(),
                report.skipped_records,
                report.failed.len(),
            );

            if let Some(path) = export {
                let rows: Vec<ExportRow> = notices.iter().map(ExportRow::from_notice).collect();
                let json = serde_json::to_vec_pretty(&rows).context("serializing export rows")?;
                std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("export written to {}", path.display());
            }
        }
        Commands::Mark { uid, kind, off } => {
            let kind = parse_kind(&kind)?;
            reconciler.load_marks().await?;
            match reconciler.toggle_mark(kind, &uid, !off).await? {
                ToggleOutcome::Committed => println!("mark committed"),
                ToggleOutcome::LocalOnly => {
                    eprintln!("warning: mark saved locally only; remote store unavailable")
                }
            }
        }
        Commands::Saved { action } => match action {
            SavedAction::List => {
                for (name, search) in reconciler.saved_searches().await? {
                    println!(
                        "{name}: keyword='{}' status={:?} regions={}",
                        search.keyword,
                        search.status.map(Status::api_value),
                        search
                            .regions
                            .iter()
                            .map(|r| r.code.as_str())
                            .collect::<Vec<_>>()
                            .join(","),
                    );
                }
            }
            SavedAction::Save {
                name,
                regions,
                status,
                keyword,
                state,
            } => {
                let search = SavedSearch {
                    keyword,
                    status: parse_status(status.as_deref())?,
                    state,
                    regions: regions
                        .iter()
                        .map(|r| parse_region(r))
                        .collect::<Result<Vec<_>>>()?,
                };
                match reconciler.save_search(&name, &search).await? {
                    ToggleOutcome::Committed => println!("search '{name}' saved"),
                    ToggleOutcome::LocalOnly => {
                        eprintln!("warning: search '{name}' saved locally only")
                    }
                }
            }
            SavedAction::Delete { name } => {
                match reconciler.delete_search(&name).await? {
                    ToggleOutcome::Committed => println!("search '{name}' deleted"),
                    ToggleOutcome::LocalOnly => {
                        eprintln!("warning: search '{name}' deleted locally only")
                    }
                }
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_argument_parses_code_name_state() {
        let region = parse_region("2800308:Aracaju:SE").unwrap();
        assert_eq!(region.code, "2800308");
        assert_eq!(region.name, "Aracaju");
        assert_eq!(region.state, "SE");

        let bare = parse_region("2800308").unwrap();
        assert_eq!(bare.name, "2800308");
        assert!(bare.state.is_empty());

        assert!(parse_region(":name:SE").is_err());
    }

    #[test]
    fn status_and_kind_arguments_are_validated() {
        assert_eq!(parse_status(None).unwrap(), None);
        assert_eq!(
            parse_status(Some("recebendo_proposta")).unwrap(),
            Some(Status::RecebendoProposta)
        );
        assert!(parse_status(Some("todos")).is_err());

        assert_eq!(parse_kind("reviewed").unwrap(), MarkKind::Reviewed);
        assert_eq!(parse_kind("rejected").unwrap(), MarkKind::Rejected);
        assert!(parse_kind("starred").is_err());
    }
}
