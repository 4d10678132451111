//! Harvest orchestrator.
//!
//! Drives a run end to end: discovers the task universe, fans tasks out
//! under a concurrency bound, pulls each package's metadata from Flathub,
//! nixpkgs, and the AUR, normalizes results into [`NpsPackage`] records for
//! the configured exporters, and folds every outcome into the checkpoint.
//!
//! Network access goes through the injected [`Fetcher`], so the whole
//! pipeline is testable without sockets. All requests funnel through
//! [`Harvester::request`], which layers the retry budget, Retry-After
//! handling, and the per-source circuit breaker.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use harvester_parsers::flathub;
use harvester_parsers::nix::parse_nix_dependencies;
use harvester_parsers::pkgbuild::parse_pkgbuild;

use crate::checkpoint::{CheckpointStore, HarvestCheckpoint, HarvestTask, TaskStatus};
use crate::error::HarvestError;
use crate::package::NpsPackage;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, ExponentialBackoff};
use crate::stats::{HarvestStats, StatsSnapshot};
use crate::traits::{Exporter, FetchResponse, Fetcher};

pub const NIXPKGS_BASE_URL: &str =
    "https://raw.githubusercontent.com/NixOS/nixpkgs/nixos-unstable";
pub const AUR_RPC_URL: &str = "https://aur.archlinux.org/rpc/";
pub const AUR_CGIT_URL: &str = "https://aur.archlinux.org/cgit/aur.git/plain/PKGBUILD";
pub const GITHUB_API_URL: &str = "https://api.github.com";

const CHECKPOINT_FILE: &str = ".harvest_checkpoint.json";
const SOURCE_DIRS: [&str; 3] = ["flathub", "nix", "arch"];
const DISCOVERY_PAGE_SIZE: usize = 100;

/// Tunables for one harvest run.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    /// Root of the on-disk cache (`flathub/`, `nix/`, `arch/` subdirs).
    pub data_dir: PathBuf,
    /// Maximum tasks in flight at once.
    pub concurrency: usize,
    /// Cap on the number of discovered tasks, mainly for trial runs.
    pub limit: Option<usize>,
    /// Resume from a persisted checkpoint when one exists.
    pub resume: bool,
    pub skip_flathub: bool,
    pub skip_nix: bool,
    pub skip_arch: bool,
    /// Save the checkpoint every N completed/failed tasks.
    pub checkpoint_interval: usize,
    pub backoff: ExponentialBackoff,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/knowledge_source"),
            concurrency: 20,
            limit: None,
            resume: true,
            skip_flathub: false,
            skip_nix: false,
            skip_arch: false,
            checkpoint_interval: 50,
            backoff: ExponentialBackoff::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Final accounting for one run, rendered by the CLI.
#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub stats: StatsSnapshot,
}

/// One unit of work: a Flathub application repository.
#[derive(Debug, Clone)]
pub struct DiscoveredRepo {
    pub app_id: String,
    pub default_branch: String,
}

#[derive(Debug, Deserialize)]
struct RepoListing {
    name: String,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AurSearchResponse {
    #[serde(default)]
    results: Vec<AurPackage>,
}

#[derive(Debug, Deserialize)]
struct AurPackage {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Version", default)]
    version: Option<String>,
    #[serde(rename = "Description", default)]
    description: Option<String>,
}

/// The orchestrator. Cheap handles (stats, breaker) are cloned into tasks;
/// exporters are shared behind `&self`.
pub struct Harvester<F: Fetcher> {
    fetcher: F,
    exporters: Vec<Box<dyn Exporter>>,
    config: HarvesterConfig,
    backoff: ExponentialBackoff,
    circuit_breaker: CircuitBreaker,
    stats: HarvestStats,
    store: CheckpointStore,
}

fn lock_checkpoint<'a>(
    checkpoint: &'a Mutex<HarvestCheckpoint>,
) -> std::sync::MutexGuard<'a, HarvestCheckpoint> {
    checkpoint.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<F: Fetcher> Harvester<F> {
    /// Build an orchestrator and make sure the cache layout exists.
    pub fn new(
        fetcher: F,
        exporters: Vec<Box<dyn Exporter>>,
        config: HarvesterConfig,
    ) -> Result<Self, HarvestError> {
        for source in SOURCE_DIRS {
            let dir = config.data_dir.join(source);
            std::fs::create_dir_all(&dir).map_err(|e| {
                HarvestError::Generic(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        let store = CheckpointStore::new(config.data_dir.join(CHECKPOINT_FILE));
        Ok(Self {
            fetcher,
            exporters,
            backoff: config.backoff.clone(),
            circuit_breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            stats: HarvestStats::new(),
            store,
            config,
        })
    }

    pub fn stats(&self) -> &HarvestStats {
        &self.stats
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run a full harvest until done or cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<HarvestReport, HarvestError> {
        let repos = if self.config.skip_flathub {
            self.discover_from_cache()?
        } else {
            self.discover_from_api().await?
        };
        if repos.is_empty() {
            return Err(HarvestError::Discovery(
                "no repositories discovered".to_string(),
            ));
        }

        info!(total = repos.len(), concurrency = self.config.concurrency, "Starting harvest");
        let checkpoint = Mutex::new(self.load_or_create_checkpoint(repos.len()));

        futures::stream::iter(&repos)
            .for_each_concurrent(self.config.concurrency, |repo| {
                let checkpoint = &checkpoint;
                let cancel = &cancel;
                async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    self.process_repository(repo, checkpoint).await;
                }
            })
            .await;

        if cancel.is_cancelled() {
            warn!("Harvest interrupted, saving checkpoint");
        }

        let report = {
            let mut cp = lock_checkpoint(&checkpoint);
            cp.touch();
            if let Err(e) = self.store.save(&cp) {
                error!(error = %e, "Failed to save final checkpoint");
            }
            HarvestReport {
                total_tasks: cp.total_tasks,
                completed: cp.completed,
                failed: cp.failed,
                stats: self.stats.snapshot(),
            }
        };

        self.finalize_exporters().await;
        info!(summary = %self.stats.summary(), "Harvest finished");
        Ok(report)
    }

    /// Remove empty or JSON-corrupt cache files. Returns how many went away.
    pub fn clean_invalid_data(&self) -> Result<usize, HarvestError> {
        let mut removed = 0usize;
        for source in SOURCE_DIRS {
            let dir = self.config.data_dir.join(source);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Cannot scan cache directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Cannot read cache file");
                        continue;
                    }
                };
                let valid = !content.is_empty()
                    && serde_json::from_str::<serde_json::Value>(&content).is_ok();
                if valid {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), "Removed invalid cache file");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
                }
            }
        }
        info!(removed, "Cache cleanup finished");
        Ok(removed)
    }

    // -- discovery ----------------------------------------------------------

    fn discover_from_cache(&self) -> Result<Vec<DiscoveredRepo>, HarvestError> {
        info!("Skipping Flathub listing, enumerating local cache");
        let dir = self.config.data_dir.join("flathub");
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| HarvestError::Discovery(format!("cannot read {}: {e}", dir.display())))?;

        let mut repos = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| HarvestError::Discovery(format!("cache listing: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                repos.push(DiscoveredRepo {
                    app_id: stem.to_string(),
                    default_branch: "master".to_string(),
                });
            }
        }
        repos.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        if let Some(limit) = self.config.limit {
            repos.truncate(limit);
        }
        Ok(repos)
    }

    async fn discover_from_api(&self) -> Result<Vec<DiscoveredRepo>, HarvestError> {
        info!(org = flathub::FLATHUB_ORG, "Listing Flathub application repositories");
        let mut repos = Vec::new();
        let mut page = 1u32;
        loop {
            let url = format!(
                "{GITHUB_API_URL}/orgs/{}/repos?type=public&per_page={DISCOVERY_PAGE_SIZE}&page={page}",
                flathub::FLATHUB_ORG
            );
            let Some(resp) = self.request(&url, "flathub").await else {
                return Err(HarvestError::Discovery(
                    "repository listing request failed".to_string(),
                ));
            };
            if !resp.is_success() {
                return Err(HarvestError::Discovery(format!(
                    "repository listing returned HTTP {}",
                    resp.status
                )));
            }
            let listing: Vec<RepoListing> = serde_json::from_str(&resp.body)
                .map_err(|e| HarvestError::Discovery(format!("malformed listing: {e}")))?;
            let page_len = listing.len();

            for repo in listing {
                if repo.archived {
                    continue;
                }
                repos.push(DiscoveredRepo {
                    app_id: repo.name,
                    default_branch: repo
                        .default_branch
                        .unwrap_or_else(|| "master".to_string()),
                });
                if repos.len() % 500 == 0 {
                    info!(discovered = repos.len(), "Discovery in progress");
                }
                if let Some(limit) = self.config.limit
                    && repos.len() >= limit
                {
                    return Ok(repos);
                }
            }

            if page_len < DISCOVERY_PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(repos)
    }

    fn load_or_create_checkpoint(&self, total: usize) -> HarvestCheckpoint {
        if self.config.resume
            && let Some(cp) = self.store.load()
        {
            info!(completed = cp.completed, failed = cp.failed, total = cp.total_tasks, "Resuming from checkpoint");
            return cp;
        }
        HarvestCheckpoint::create(total)
    }

    // -- per-task pipeline --------------------------------------------------

    async fn process_repository(
        &self,
        repo: &DiscoveredRepo,
        checkpoint: &Mutex<HarvestCheckpoint>,
    ) {
        let app_id = repo.app_id.as_str();
        if lock_checkpoint(checkpoint).is_completed(app_id) {
            self.stats.record_skipped_task();
            debug!(app_id, "Already completed, skipping");
            return;
        }

        let mut task = HarvestTask::new(app_id);
        task.status = TaskStatus::InProgress;

        match self.harvest_one(&mut task, repo).await {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                debug!(app_id, sources = ?task.sources_fetched, "Task completed");
                lock_checkpoint(checkpoint).record_completed(app_id, task.pkg_name.clone());
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.last_error = Some(e.to_string());
                debug!(app_id, error = %e, "Task failed");
                lock_checkpoint(checkpoint).record_failed(app_id, e.to_string());
            }
        }

        self.maybe_save_checkpoint(checkpoint);
    }

    /// Periodic save, every `checkpoint_interval` settled tasks. Clones the
    /// state under the lock and writes outside it.
    fn maybe_save_checkpoint(&self, checkpoint: &Mutex<HarvestCheckpoint>) {
        let interval = self.config.checkpoint_interval.max(1);
        let snapshot = {
            let mut cp = lock_checkpoint(checkpoint);
            let settled = cp.completed + cp.failed;
            if settled == 0 || settled % interval != 0 {
                return;
            }
            cp.touch();
            cp.clone()
        };
        match self.store.save(&snapshot) {
            Ok(()) => debug!(summary = %self.stats.summary(), "Checkpoint saved"),
            Err(e) => error!(error = %e, "Failed to save checkpoint"),
        }
    }

    async fn harvest_one(
        &self,
        task: &mut HarvestTask,
        repo: &DiscoveredRepo,
    ) -> Result<(), HarvestError> {
        task.attempts += 1;
        let pkg_name = self.resolve_package_name(repo, task).await?;
        if let Some(name) = pkg_name {
            task.pkg_name = Some(name.clone());
            self.fetch_secondary_sources(&name, task).await?;
        }
        Ok(())
    }

    /// Flathub is the name authority: a valid cached manifest or a freshly
    /// fetched one yields the package name the other sources are keyed by.
    async fn resolve_package_name(
        &self,
        repo: &DiscoveredRepo,
        task: &mut HarvestTask,
    ) -> Result<Option<String>, HarvestError> {
        let app_id = repo.app_id.as_str();
        let cache = self
            .config
            .data_dir
            .join("flathub")
            .join(format!("{app_id}.json"));
        if let Some(name) = self.package_name_from_cache(app_id, &cache).await {
            task.sources_fetched.push("flathub".to_string());
            return Ok(Some(name));
        }

        if !self.config.skip_flathub
            && self
                .fetch_flathub_manifest(app_id, &repo.default_branch)
                .await
        {
            task.sources_fetched.push("flathub".to_string());
            return Ok(flathub::extract_package_name(app_id));
        }
        Ok(None)
    }

    async fn package_name_from_cache(&self, app_id: &str, path: &Path) -> Option<String> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        if content.is_empty() {
            return None;
        }
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&content) {
            debug!(path = %path.display(), error = %e, "Ignoring corrupt cache file");
            return None;
        }
        flathub::extract_package_name(app_id)
    }

    /// Try each known manifest location in the app repository until one hits.
    async fn fetch_flathub_manifest(&self, app_id: &str, branch: &str) -> bool {
        for url in flathub::manifest_urls(app_id, branch) {
            let Some(resp) = self.request(&url, "flathub").await else {
                continue;
            };
            if !resp.is_success() || resp.is_empty() {
                continue;
            }

            let ext = url.rsplit('.').next().unwrap_or("json");
            let dest = self
                .config
                .data_dir
                .join("flathub")
                .join(format!("{app_id}.{ext}"));
            if let Err(e) = tokio::fs::write(&dest, &resp.body).await {
                error!(app_id, error = %e, "Failed to save Flathub manifest");
                continue;
            }
            debug!(app_id, url = %url, "Saved Flathub manifest");

            let name =
                flathub::extract_package_name(app_id).unwrap_or_else(|| app_id.to_string());
            let pkg = NpsPackage::new(format!("flathub:{app_id}"), name, "flathub")
                .with_metadata(serde_json::json!({
                    "app_id": app_id,
                    "manifest_url": url,
                }));
            self.export_package(&pkg).await;
            return true;
        }
        false
    }

    /// Nix and AUR lookups for one package name, fetched concurrently.
    /// Each side is skipped when cached, disabled, or circuit-suppressed.
    async fn fetch_secondary_sources(
        &self,
        pkg_name: &str,
        task: &mut HarvestTask,
    ) -> Result<(), HarvestError> {
        let nix_cache = self
            .config
            .data_dir
            .join("nix")
            .join(format!("{pkg_name}.json"));
        let arch_cache = self
            .config
            .data_dir
            .join("arch")
            .join(format!("{pkg_name}.json"));
        let want_nix = !self.config.skip_nix && !nix_cache.exists();
        let want_arch = !self.config.skip_arch && !arch_cache.exists();

        let (nix_fetched, arch_fetched) = tokio::join!(
            async {
                if want_nix {
                    self.fetch_nix_expression(pkg_name).await
                } else {
                    Ok(false)
                }
            },
            async {
                if want_arch {
                    self.fetch_aur_package(pkg_name).await
                } else {
                    Ok(false)
                }
            },
        );

        if nix_fetched? {
            task.sources_fetched.push("nix".to_string());
        }
        if arch_fetched? {
            task.sources_fetched.push("arch".to_string());
        }
        Ok(())
    }

    /// Probe likely nixpkgs paths for this package's derivation and parse
    /// its dependency lists.
    async fn fetch_nix_expression(&self, pkg_name: &str) -> Result<bool, HarvestError> {
        if self.circuit_breaker.is_open("nix") {
            return Ok(false);
        }

        let prefix: String = pkg_name.chars().take(2).collect();
        let candidates = [
            format!("pkgs/by-name/{prefix}/{pkg_name}/package.nix"),
            format!("pkgs/applications/{pkg_name}/default.nix"),
            format!("pkgs/applications/audio/{pkg_name}/default.nix"),
            format!("pkgs/applications/graphics/{pkg_name}/default.nix"),
            format!("pkgs/applications/networking/{pkg_name}/default.nix"),
            format!("pkgs/applications/office/{pkg_name}/default.nix"),
            format!("pkgs/applications/video/{pkg_name}/default.nix"),
            format!("pkgs/applications/misc/{pkg_name}/default.nix"),
            format!("pkgs/games/{pkg_name}/default.nix"),
            format!("pkgs/tools/misc/{pkg_name}/default.nix"),
        ];

        for path in candidates {
            let url = format!("{NIXPKGS_BASE_URL}/{path}");
            let Some(resp) = self.request(&url, "nix").await else {
                continue;
            };
            if !resp.is_success() || resp.is_empty() {
                continue;
            }

            let deps = parse_nix_dependencies(&resp.body, Some(pkg_name));
            let json = deps.to_json();
            let dest = self
                .config
                .data_dir
                .join("nix")
                .join(format!("{pkg_name}.json"));
            let text = serde_json::to_string_pretty(&json)?;
            tokio::fs::write(&dest, text).await.map_err(|e| {
                HarvestError::Generic(format!("cannot save nix cache for {pkg_name}: {e}"))
            })?;
            debug!(package = pkg_name, quality = %deps.parse_quality.as_str(), "Parsed Nix expression");

            let pkg = NpsPackage::new(format!("nix:{pkg_name}"), pkg_name, "nix")
                .with_dependencies(deps.build_inputs.iter().cloned().collect())
                .with_build_dependencies(deps.native_build_inputs.iter().cloned().collect())
                .with_metadata(json);
            self.export_package(&pkg).await;
            return Ok(true);
        }
        Ok(false)
    }

    /// AUR lookup: RPC search for the name, then the PKGBUILD of the best
    /// match. Malformed upstream payloads drop the source, not the task.
    async fn fetch_aur_package(&self, pkg_name: &str) -> Result<bool, HarvestError> {
        if self.circuit_breaker.is_open("arch") {
            return Ok(false);
        }

        let search_url = format!("{AUR_RPC_URL}?v=5&type=search&arg={pkg_name}");
        let Some(resp) = self.request(&search_url, "arch").await else {
            return Ok(false);
        };
        if !resp.is_success() {
            return Ok(false);
        }

        let search: AurSearchResponse = match serde_json::from_str(&resp.body) {
            Ok(search) => search,
            Err(e) => {
                debug!(package = pkg_name, error = %e, "Malformed AUR search response");
                return Ok(false);
            }
        };
        let Some(best) = search
            .results
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(pkg_name))
            .or_else(|| search.results.first())
        else {
            return Ok(false);
        };

        let pkgbuild_url = format!("{AUR_CGIT_URL}?h={}", best.name);
        let Some(pb_resp) = self.request(&pkgbuild_url, "arch").await else {
            return Ok(false);
        };
        if !pb_resp.is_success() || pb_resp.is_empty() {
            return Ok(false);
        }

        let parsed = parse_pkgbuild(&pb_resp.body);
        let record = serde_json::json!({
            "name": best.name,
            "version": best.version,
            "description": best.description,
            "depends": parsed.depends,
            "makedepends": parsed.makedepends,
        });
        let dest = self
            .config
            .data_dir
            .join("arch")
            .join(format!("{pkg_name}.json"));
        let text = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&dest, text).await.map_err(|e| {
            HarvestError::Generic(format!("cannot save arch cache for {pkg_name}: {e}"))
        })?;
        debug!(package = pkg_name, aur_name = %best.name, "Fetched AUR package");

        let pkg = NpsPackage::new(format!("arch:{}", best.name), best.name.clone(), "arch")
            .with_version(best.version.clone())
            .with_description(best.description.clone())
            .with_dependencies(parsed.depends.clone())
            .with_build_dependencies(parsed.makedepends.clone())
            .with_metadata(record);
        self.export_package(&pkg).await;
        Ok(true)
    }

    // -- export fan-out -----------------------------------------------------

    /// Offer one record to every sink. A failing sink is logged and skipped;
    /// it never aborts the task or its siblings.
    async fn export_package(&self, package: &NpsPackage) {
        for exporter in &self.exporters {
            if let Err(e) = exporter.export(package).await {
                error!(exporter = exporter.name(), package = %package.id, error = %e, "Export failed");
            }
        }
    }

    async fn finalize_exporters(&self) {
        for exporter in &self.exporters {
            if let Err(e) = exporter.finalize().await {
                error!(exporter = exporter.name(), error = %e, "Exporter finalize failed");
            }
        }
    }

    // -- resilient request loop ---------------------------------------------

    /// One logical request with a bounded retry loop.
    ///
    /// Returns `None` when the circuit is open or the retry budget is
    /// exhausted; any received non-429 response, success or not, is handed
    /// back for the caller to interpret. A 429 honors the server's
    /// `Retry-After` before retrying.
    async fn request(&self, url: &str, source: &str) -> Option<FetchResponse> {
        let mut attempt = 0u32;
        loop {
            if self.circuit_breaker.is_open(source) {
                debug!(source, url, "Circuit open, suppressing request");
                return None;
            }

            self.stats.record_attempt();
            match self.fetcher.fetch(url).await {
                Ok(resp) => {
                    if resp.is_success() {
                        self.stats.record_success(source, resp.len() as u64);
                        self.circuit_breaker.record_success(source);
                    } else {
                        self.stats.record_http_failure(source);
                    }

                    if resp.status == 429 {
                        let retry_after = resp.retry_after.unwrap_or(60);
                        if self.backoff.should_retry(attempt) {
                            warn!(source, retry_after, "Rate limited, honoring Retry-After");
                            tokio::time::sleep(Duration::from_secs(retry_after)).await;
                            attempt += 1;
                            continue;
                        }
                        // The 429 itself was already tallied against the source.
                        self.stats.record_exhausted();
                        self.circuit_breaker.record_failure(source);
                        return None;
                    }
                    return Some(resp);
                }
                Err(e) if e.is_retryable() && self.backoff.should_retry(attempt) => {
                    self.stats.record_failure(source);
                    let delay = self.backoff.calculate_delay(attempt);
                    debug!(
                        source,
                        url,
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.stats.record_failure(source);
                    if e.should_trip_circuit() {
                        self.circuit_breaker.record_failure(source);
                    }
                    debug!(source, url, error = %e, attempts = attempt + 1, "Request given up");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FailingExporter, MockFetcher, RecordingExporter};
    use std::time::Duration;

    fn test_config(data_dir: &Path) -> HarvesterConfig {
        HarvesterConfig {
            data_dir: data_dir.to_path_buf(),
            concurrency: 4,
            skip_flathub: true,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(1),
                Duration::from_millis(2),
                2,
            ),
            ..HarvesterConfig::default()
        }
    }

    fn seed_flathub_cache(data_dir: &Path, app_id: &str) {
        let dir = data_dir.join("flathub");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{app_id}.json")), "{}").unwrap();
    }

    #[tokio::test]
    async fn fresh_run_exports_nix_and_arch_records() {
        let dir = tempfile::tempdir().unwrap();
        seed_flathub_cache(dir.path(), "org.test.App");

        let fetcher = MockFetcher::new()
            .route(
                "pkgs/by-name/ap/app/package.nix",
                200,
                "buildInputs = [ glib gtk3 ];\nnativeBuildInputs = [ meson ];",
            )
            .route(
                "aur.archlinux.org/rpc",
                200,
                r#"{"results":[{"Name":"app","Version":"1.0","Description":"An app"}]}"#,
            )
            .route(
                "cgit/aur.git",
                200,
                "pkgname=app\npkgver=1.0\ndepends=('gtk3')\nmakedepends=('meson')\n",
            );
        let recording = RecordingExporter::new();
        let harvester = Harvester::new(
            fetcher,
            vec![Box::new(recording.clone())],
            test_config(dir.path()),
        )
        .unwrap();

        let report = harvester.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.total_tasks, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);

        let ids = recording.exported_ids();
        assert!(ids.contains(&"nix:app".to_string()), "{ids:?}");
        assert!(ids.contains(&"arch:app".to_string()), "{ids:?}");

        let exported = recording.exported.lock().unwrap();
        let nix = exported.iter().find(|p| p.id == "nix:app").unwrap();
        assert!(nix.dependencies.contains(&"glib".to_string()));
        assert!(nix.build_dependencies.contains(&"meson".to_string()));
        let arch = exported.iter().find(|p| p.id == "arch:app").unwrap();
        assert_eq!(arch.version.as_deref(), Some("1.0"));
        drop(exported);

        assert!(dir.path().join("nix/app.json").exists());
        assert!(dir.path().join("arch/app.json").exists());

        let cp = harvester.checkpoint_store().load().unwrap();
        assert_eq!(cp.completed, 1);
        assert_eq!(
            cp.tasks["org.test.App"].pkg_name.as_deref(),
            Some("app")
        );
        assert_eq!(*recording.finalize_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn resume_skips_completed_tasks_without_requests() {
        let dir = tempfile::tempdir().unwrap();
        seed_flathub_cache(dir.path(), "org.test.App");

        let store = CheckpointStore::new(dir.path().join(CHECKPOINT_FILE));
        let mut cp = HarvestCheckpoint::create(1);
        cp.record_completed("org.test.App", Some("app".into()));
        store.save(&cp).unwrap();

        let fetcher = MockFetcher::new();
        let recording = RecordingExporter::new();
        let harvester = Harvester::new(
            fetcher.clone(),
            vec![Box::new(recording.clone())],
            test_config(dir.path()),
        )
        .unwrap();

        let report = harvester.run(CancellationToken::new()).await.unwrap();
        assert!(fetcher.requested_urls().is_empty());
        assert!(recording.exported.lock().unwrap().is_empty());
        assert_eq!(report.completed, 1);
        assert_eq!(report.stats.tasks_skipped, 1);

        // The pre-existing record must survive the run untouched.
        let reloaded = harvester.checkpoint_store().load().unwrap();
        assert_eq!(reloaded.completed, 1);
        assert_eq!(
            reloaded.tasks["org.test.App"].pkg_name.as_deref(),
            Some("app")
        );
    }

    #[tokio::test]
    async fn no_resume_reharvests_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        seed_flathub_cache(dir.path(), "org.test.App");

        let store = CheckpointStore::new(dir.path().join(CHECKPOINT_FILE));
        let mut cp = HarvestCheckpoint::create(1);
        cp.record_completed("org.test.App", Some("app".into()));
        store.save(&cp).unwrap();

        let fetcher = MockFetcher::new();
        let mut config = test_config(dir.path());
        config.resume = false;
        let harvester = Harvester::new(fetcher.clone(), Vec::new(), config).unwrap();

        harvester.run(CancellationToken::new()).await.unwrap();
        // Task ran again: the nix and arch sources were queried.
        assert!(!fetcher.requested_urls().is_empty());
    }

    #[tokio::test]
    async fn failing_exporter_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        seed_flathub_cache(dir.path(), "org.test.App");

        let fetcher = MockFetcher::new().route(
            "pkgs/by-name/ap/app/package.nix",
            200,
            "buildInputs = [ glib ];",
        );
        let recording = RecordingExporter::new();
        let harvester = Harvester::new(
            fetcher,
            vec![Box::new(FailingExporter), Box::new(recording.clone())],
            test_config(dir.path()),
        )
        .unwrap();

        let report = harvester.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(recording.exported_ids(), vec!["nix:app".to_string()]);
        assert_eq!(*recording.finalize_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn request_gives_up_after_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new().route_error("example.com", "connection refused");
        let harvester =
            Harvester::new(fetcher, Vec::new(), test_config(dir.path())).unwrap();

        let resp = harvester.request("https://example.com/x", "nix").await;
        assert!(resp.is_none());

        // Initial attempt plus two retries.
        let snap = harvester.stats().snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.failed_requests, 3);
        assert_eq!(harvester.circuit_breaker().failure_count("nix"), 1);
    }

    #[tokio::test]
    async fn rate_limit_honors_retry_after_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new().route_rate_limited("example.com", 0);
        let mut config = test_config(dir.path());
        config.backoff.max_retries = 1;
        let harvester = Harvester::new(fetcher, Vec::new(), config).unwrap();

        let resp = harvester.request("https://example.com/x", "arch").await;
        assert!(resp.is_none());
        let snap = harvester.stats().snapshot();
        assert_eq!(snap.total_requests, 2);
        // Each 429 counts once against the source; giving up adds a single
        // overall failure on top.
        assert_eq!(snap.sources["arch"].fail, 2);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(harvester.circuit_breaker().failure_count("arch"), 1);
    }

    #[tokio::test]
    async fn open_circuit_suppresses_requests() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        let mut config = test_config(dir.path());
        config.circuit_breaker.failure_threshold = 1;
        let harvester = Harvester::new(fetcher.clone(), Vec::new(), config).unwrap();

        harvester.circuit_breaker().record_failure("nix");
        let resp = harvester.request("https://example.com/x", "nix").await;
        assert!(resp.is_none());
        assert!(fetcher.requested_urls().is_empty());
        assert_eq!(harvester.stats().snapshot().total_requests, 0);
    }

    #[tokio::test]
    async fn non_success_response_is_returned_to_caller() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new().route("example.com", 500, "oops");
        let harvester =
            Harvester::new(fetcher, Vec::new(), test_config(dir.path())).unwrap();

        let resp = harvester.request("https://example.com/x", "nix").await;
        assert_eq!(resp.map(|r| r.status), Some(500));
        let snap = harvester.stats().snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.sources["nix"].fail, 1);
    }

    #[tokio::test]
    async fn discovery_from_api_filters_archived_repos() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new().route(
            "orgs/flathub/repos",
            200,
            r#"[
                {"name":"org.a.One","archived":false,"default_branch":"main"},
                {"name":"org.b.Two","archived":true,"default_branch":"master"},
                {"name":"org.c.Three"}
            ]"#,
        );
        let mut config = test_config(dir.path());
        config.skip_flathub = false;
        let harvester = Harvester::new(fetcher, Vec::new(), config).unwrap();

        let repos = harvester.discover_from_api().await.unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].app_id, "org.a.One");
        assert_eq!(repos[0].default_branch, "main");
        assert_eq!(repos[1].default_branch, "master");
    }

    #[tokio::test]
    async fn discovery_limit_caps_task_count() {
        let dir = tempfile::tempdir().unwrap();
        seed_flathub_cache(dir.path(), "org.a.One");
        seed_flathub_cache(dir.path(), "org.b.Two");
        seed_flathub_cache(dir.path(), "org.c.Three");

        let mut config = test_config(dir.path());
        config.limit = Some(2);
        let harvester = Harvester::new(MockFetcher::new(), Vec::new(), config).unwrap();

        let repos = harvester.discover_from_cache().unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].app_id, "org.a.One");
    }

    #[tokio::test]
    async fn empty_discovery_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let harvester =
            Harvester::new(MockFetcher::new(), Vec::new(), test_config(dir.path())).unwrap();
        let err = harvester.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HarvestError::Discovery(_)));
    }

    #[tokio::test]
    async fn cancelled_token_stops_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        seed_flathub_cache(dir.path(), "org.test.App");

        let fetcher = MockFetcher::new();
        let harvester =
            Harvester::new(fetcher.clone(), Vec::new(), test_config(dir.path())).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = harvester.run(cancel).await.unwrap();
        assert_eq!(report.completed, 0);
        assert!(fetcher.requested_urls().is_empty());
        // A checkpoint is still written so the next run can resume.
        assert!(harvester.checkpoint_store().load().is_some());
    }

    #[tokio::test]
    async fn task_completes_when_secondary_sources_miss() {
        // nix and arch 404 everywhere: the task still settles as completed.
        let dir = tempfile::tempdir().unwrap();
        seed_flathub_cache(dir.path(), "org.test.App");

        let harvester =
            Harvester::new(MockFetcher::new(), Vec::new(), test_config(dir.path())).unwrap();
        let report = harvester.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);

        let cp = harvester.checkpoint_store().load().unwrap();
        assert_eq!(cp.tasks["org.test.App"].pkg_name.as_deref(), Some("app"));
    }

    #[test]
    fn clean_removes_empty_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let harvester =
            Harvester::new(MockFetcher::new(), Vec::new(), test_config(dir.path())).unwrap();

        let nix = dir.path().join("nix");
        std::fs::write(nix.join("empty.json"), "").unwrap();
        std::fs::write(nix.join("corrupt.json"), "{ nope").unwrap();
        std::fs::write(nix.join("valid.json"), r#"{"ok":true}"#).unwrap();
        std::fs::write(nix.join("notes.txt"), "not json").unwrap();

        let removed = harvester.clean_invalid_data().unwrap();
        assert_eq!(removed, 2);
        assert!(nix.join("valid.json").exists());
        assert!(nix.join("notes.txt").exists());
        assert!(!nix.join("empty.json").exists());
        assert!(!nix.join("corrupt.json").exists());
    }

    #[test]
    fn default_config_matches_operational_limits() {
        let config = HarvesterConfig::default();
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.checkpoint_interval, 50);
        assert!(config.resume);
    }
}
