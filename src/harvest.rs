//! Orchestrator: one harvest invocation from configuration to record sets.
//!
//! Each server goes through `Init → ResumeScan → Fetching → Aggregating`
//! and ends in `Done` or `Failed`. Servers are processed one after the
//! other; pages within a server are fetched concurrently.
//!
//! A failed run keeps every persisted checkpoint, including an ephemeral
//! directory, which is retained and reported so the run can be resumed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::aggregate::{AffiliationFilter, FinalRecordSet, aggregate};
use crate::checkpoint::{CheckpointError, CheckpointLocation, CheckpointStore, QuerySignature, scan};
use crate::config::{ConfigError, HarvestConfig, Server};
use crate::fetch::{CatalogClient, FetchError, FetchErrorKind, PageFetcher, PageQuery, PageSource};
use crate::scheduler::{FetchScheduler, ProgressSink, SchedulerError};

/// Phase of a server's harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Configuration validated, checkpoint location resolved.
    Init,
    /// Inspecting persisted pages.
    ResumeScan,
    /// Fetching missing pages.
    Fetching,
    /// Filtering and deduplicating.
    Aggregating,
    /// Records produced.
    Done,
    /// Stopped on an error; checkpoints preserved.
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ResumeScan => "resume-scan",
            Self::Fetching => "fetching",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors that end a harvest.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[source] ConfigError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The checkpoint directory could not be prepared.
    #[error("{server}: cannot prepare checkpoint directory: {source}")]
    Location {
        /// Server being harvested.
        server: Server,
        /// Store failure.
        #[source]
        source: CheckpointError,
    },

    /// The checkpoint store failed.
    #[error(
        "{server}: checkpoint error: {source}. Re-run with --temp-outdir {dir} to resume from the last persisted page",
        dir = .checkpoint_dir.display()
    )]
    Checkpoint {
        /// Server being harvested.
        server: Server,
        /// Directory holding the persisted pages.
        checkpoint_dir: PathBuf,
        /// Store failure.
        #[source]
        source: CheckpointError,
    },

    /// A page could not be fetched.
    #[error(
        "{server}: page {page_index} failed ({kind}): {cause}. Re-run with --temp-outdir {dir} to resume from the last persisted page",
        cause = .source.request_error(),
        dir = .checkpoint_dir.display()
    )]
    Fetch {
        /// Server being harvested.
        server: Server,
        /// Failing page.
        page_index: u64,
        /// Failure class.
        kind: FetchErrorKind,
        /// Directory holding the persisted pages.
        checkpoint_dir: PathBuf,
        /// The fetch failure.
        #[source]
        source: FetchError,
    },

    /// Fetch workers exited with pages outstanding.
    #[error(
        "{server}: fetch workers stopped unexpectedly. Re-run with --temp-outdir {dir} to resume from the last persisted page",
        dir = .checkpoint_dir.display()
    )]
    WorkersStopped {
        /// Server being harvested.
        server: Server,
        /// Directory holding the persisted pages.
        checkpoint_dir: PathBuf,
    },

    /// Fetching finished but pages below the last one are missing.
    #[error(
        "{server}: pagination incomplete, missing pages {missing:?}. Re-run with --temp-outdir {dir} to resume from the last persisted page",
        dir = .checkpoint_dir.display()
    )]
    IncompletePagination {
        /// Server being harvested.
        server: Server,
        /// Directory holding the persisted pages.
        checkpoint_dir: PathBuf,
        /// Missing indices; empty when no terminal page was persisted.
        missing: Vec<u64>,
    },
}

impl HarvestError {
    fn checkpoint(server: Server, checkpoint_dir: &Path, source: CheckpointError) -> Self {
        Self::Checkpoint {
            server,
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            source,
        }
    }

    fn from_scheduler(server: Server, error: SchedulerError, checkpoint_dir: PathBuf) -> Self {
        match error {
            SchedulerError::Fetch(source) => Self::Fetch {
                server,
                page_index: source.page_index(),
                kind: source.kind(),
                checkpoint_dir,
                source,
            },
            SchedulerError::Checkpoint { source, .. } => Self::Checkpoint {
                server,
                checkpoint_dir,
                source,
            },
            SchedulerError::WorkersStopped => Self::WorkersStopped {
                server,
                checkpoint_dir,
            },
        }
    }
}

/// Records harvested from one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRecords {
    /// The server.
    pub server: Server,
    /// Its deduplicated records.
    pub records: FinalRecordSet,
}

/// Result of a harvest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarvestOutput {
    /// One set per server, in server order.
    pub per_server: Vec<ServerRecords>,
    /// Concatenation of the per-server sets when more than one server ran.
    pub combined: Option<FinalRecordSet>,
}

/// Runs harvests for a validated configuration.
pub struct Harvester {
    config: HarvestConfig,
    source: Arc<dyn PageSource>,
}

impl fmt::Debug for Harvester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harvester")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Harvester {
    /// Validates `config` and builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] for invalid configuration and
    /// [`HarvestError::Client`] if the client cannot be built.
    pub fn new(config: HarvestConfig) -> Result<Self, HarvestError> {
        config.validate().map_err(HarvestError::Config)?;
        let base_url = config.base_url().map_err(HarvestError::Config)?;
        let client =
            CatalogClient::new(base_url, config.request_timeout).map_err(HarvestError::Client)?;
        Ok(Self {
            config,
            source: Arc::new(client),
        })
    }

    /// Validates `config` and uses `source` for every page request.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] for invalid configuration.
    pub fn with_source(
        config: HarvestConfig,
        source: Arc<dyn PageSource>,
    ) -> Result<Self, HarvestError> {
        config.validate().map_err(HarvestError::Config)?;
        Ok(Self { config, source })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Harvests every configured server in turn.
    ///
    /// # Errors
    ///
    /// Returns the first [`HarvestError`]; servers after the failing one are
    /// not attempted.
    #[instrument(skip(self, progress), fields(
        start = %self.config.start_date,
        end = %self.config.end_date,
        target = self.config.target_affiliation.as_deref().unwrap_or("-"),
    ))]
    pub async fn run(&self, progress: &dyn ProgressSink) -> Result<HarvestOutput, HarvestError> {
        let servers = self.config.servers.servers();
        let mut per_server = Vec::with_capacity(servers.len());
        for server in servers {
            let records = self.harvest_server(server, progress).await?;
            per_server.push(ServerRecords { server, records });
        }

        let combined = (per_server.len() > 1)
            .then(|| FinalRecordSet::concat(per_server.iter().map(|set| &set.records)));
        Ok(HarvestOutput {
            per_server,
            combined,
        })
    }

    async fn harvest_server(
        &self,
        server: Server,
        progress: &dyn ProgressSink,
    ) -> Result<FinalRecordSet, HarvestError> {
        enter(server, RunPhase::Init);
        let location = CheckpointLocation::prepare(self.config.checkpoint_location.as_deref(), server)
            .map_err(|source| HarvestError::Location { server, source })?;

        match self.run_phases(server, &location, progress).await {
            Ok(records) => {
                enter(server, RunPhase::Done);
                if let Err(error) = location.cleanup() {
                    warn!(%server, %error, "failed to remove ephemeral checkpoint directory");
                }
                progress.server_finished(server, records.len());
                Ok(records)
            }
            Err(error) => {
                enter(server, RunPhase::Failed);
                let ephemeral = location.is_ephemeral();
                let path = location.retain();
                warn!(
                    %server,
                    path = %path.display(),
                    ephemeral,
                    "checkpoints preserved for resume"
                );
                Err(error)
            }
        }
    }

    async fn run_phases(
        &self,
        server: Server,
        location: &CheckpointLocation,
        progress: &dyn ProgressSink,
    ) -> Result<FinalRecordSet, HarvestError> {
        let config = &self.config;
        let query = PageQuery {
            server,
            start_date: config.start_date,
            end_date: config.end_date,
            page_size: config.page_size,
        };
        let signature = QuerySignature::new(
            server,
            config.start_date,
            config.end_date,
            config.target_affiliation.as_deref(),
        );
        let dir = location.path();
        let store =
            CheckpointStore::open(dir).map_err(|e| HarvestError::checkpoint(server, dir, e))?;

        enter(server, RunPhase::ResumeScan);
        let resume = scan(&store, &signature).map_err(|e| HarvestError::checkpoint(server, dir, e))?;
        progress.server_started(server, resume.completed_pages.len() as u64);

        if resume.is_complete() {
            info!(%server, pages = resume.completed_pages.len(), "all pages already persisted");
        } else {
            enter(server, RunPhase::Fetching);
            let fetcher = Arc::new(PageFetcher::new(
                Arc::clone(&self.source),
                config.retry_policy(),
            ));
            let scheduler =
                FetchScheduler::new(fetcher, store.clone(), config.concurrency, config.pause);
            scheduler
                .run(&query, &signature, &resume, progress)
                .await
                .map_err(|e| HarvestError::from_scheduler(server, e, dir.to_path_buf()))?;

            let after = scan(&store, &signature).map_err(|e| HarvestError::checkpoint(server, dir, e))?;
            if !after.is_complete() {
                return Err(HarvestError::IncompletePagination {
                    server,
                    checkpoint_dir: dir.to_path_buf(),
                    missing: after.gaps.into_iter().collect(),
                });
            }
        }

        enter(server, RunPhase::Aggregating);
        let filter = config.target_affiliation.as_deref().map(AffiliationFilter::new);
        aggregate(&store, &signature, filter.as_ref()).map_err(|e| HarvestError::checkpoint(server, dir, e))
    }
}

fn enter(server: Server, phase: RunPhase) {
    info!(%server, %phase, "harvest phase");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::ServerSelection;
    use crate::fetch::test_support::{ScriptedSource, Step};
    use crate::scheduler::NoProgress;

    fn config(dir: Option<&TempDir>, servers: ServerSelection) -> HarvestConfig {
        HarvestConfig {
            servers,
            start_date: "2020-01-01".parse().unwrap(),
            end_date: "2020-12-31".parse().unwrap(),
            pause: Duration::ZERO,
            concurrency: 2,
            max_retries: 3,
            checkpoint_location: dir.map(|d| d.path().to_path_buf()),
            page_size: 10,
            retry_base_delay: Duration::from_millis(1),
            retry_jitter: false,
            ..HarvestConfig::default()
        }
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(RunPhase::ResumeScan.to_string(), "resume-scan");
        assert_eq!(RunPhase::Failed.to_string(), "failed");
    }

    #[test]
    fn test_incomplete_pagination_reports_resume_hint() {
        let err = HarvestError::IncompletePagination {
            server: Server::Medrxiv,
            checkpoint_dir: PathBuf::from("/tmp/medrxiv_batches_x"),
            missing: vec![1, 4],
        };

        let message = err.to_string();
        assert!(message.starts_with("medrxiv: pagination incomplete"), "{message}");
        assert!(message.contains("[1, 4]"), "{message}");
        assert!(
            message.contains("--temp-outdir /tmp/medrxiv_batches_x"),
            "{message}"
        );
    }

    #[test]
    fn test_checkpoint_error_reports_resume_hint() {
        let source = CheckpointError::Io {
            path: PathBuf::from("/ckpt/unit.json"),
            source: std::io::Error::other("disk full"),
        };
        let err = HarvestError::checkpoint(Server::Biorxiv, Path::new("/ckpt"), source);

        let message = err.to_string();
        assert!(message.contains("disk full"), "{message}");
        assert!(message.contains("--temp-outdir /ckpt"), "{message}");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config(None, ServerSelection::Biorxiv);
        bad.concurrency = 0;
        let err = Harvester::with_source(bad, Arc::new(ScriptedSource::new(10))).unwrap_err();
        assert!(matches!(
            err,
            HarvestError::Config(ConfigError::InvalidConcurrency { value: 0 })
        ));
    }

    #[tokio::test]
    async fn test_run_single_server() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(10)
            .script(0, &[Step::Records(10)])
            .script(1, &[Step::Records(3)]);
        let harvester =
            Harvester::with_source(config(Some(&dir), ServerSelection::Biorxiv), Arc::new(source))
                .unwrap();

        let output = harvester.run(&NoProgress).await.unwrap();

        assert_eq!(output.per_server.len(), 1);
        assert_eq!(output.per_server[0].records.len(), 13);
        assert!(output.combined.is_none());
    }

    #[tokio::test]
    async fn test_fetch_error_reports_resume_hint() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(10)
            .script(0, &[Step::Records(10)])
            .script(1, &[Step::Status(500)]);
        let harvester =
            Harvester::with_source(config(Some(&dir), ServerSelection::Biorxiv), Arc::new(source))
                .unwrap();

        let err = harvester.run(&NoProgress).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("page 1"), "{message}");
        assert!(message.contains("retries exhausted"), "{message}");
        assert!(message.contains("--temp-outdir"), "{message}");
        assert!(matches!(err, HarvestError::Fetch { page_index: 1, .. }));
    }

    #[tokio::test]
    async fn test_failed_run_keeps_ephemeral_directory() {
        let source = ScriptedSource::new(10).script(0, &[Step::Status(400)]);
        let harvester =
            Harvester::with_source(config(None, ServerSelection::Medrxiv), Arc::new(source))
                .unwrap();

        let err = harvester.run(&NoProgress).await.unwrap_err();

        let HarvestError::Fetch { checkpoint_dir, kind, .. } = err else {
            panic!("expected fetch error");
        };
        assert_eq!(kind, FetchErrorKind::Fatal);
        assert!(checkpoint_dir.is_dir());
        std::fs::remove_dir_all(checkpoint_dir).unwrap();
    }

    #[tokio::test]
    async fn test_both_servers_combined() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(10).script(0, &[Step::Records(2)]);
        let harvester =
            Harvester::with_source(config(Some(&dir), ServerSelection::Both), Arc::new(source))
                .unwrap();

        let output = harvester.run(&NoProgress).await.unwrap();

        let servers: Vec<Server> = output.per_server.iter().map(|s| s.server).collect();
        assert_eq!(servers, vec![Server::Biorxiv, Server::Medrxiv]);
        assert_eq!(output.combined.unwrap().len(), 4);
    }
}
