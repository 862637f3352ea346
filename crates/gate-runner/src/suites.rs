//! Suite import resolver.
//!
//! Suites are fetched as binary snapshots into `<root>/<name>`. A resolved
//! suite is memoized for the lifetime of the resolver.

use crate::archive::extract_archive;
use crate::fsutil::{atomic_write_json_pretty, ensure_dir, sha256_bytes};
use crate::process::{CaptureMode, ProcessInvocation, ProcessRunner};
use crate::GateError;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const METADATA_FILE: &str = "suite.json";
pub const BINARY_BRANCH: &str = "binary";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReference {
    pub name: String,
    /// Explicit version or resolved branch head.
    pub version: Option<String>,
    pub source_url: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteState {
    Unresolved,
    Resolving,
    Resolved,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSuite {
    pub name: String,
    pub version: String,
    pub source_url: String,
    pub path: PathBuf,
}

impl ResolvedSuite {
    pub fn dists_dir(&self) -> PathBuf {
        self.path.join("dists")
    }

    pub fn dist_jar(&self, dist: &str) -> PathBuf {
        self.dists_dir().join(format!("{}.jar", dist))
    }

    /// Native distributions ship as tarballs.
    pub fn native_dist(&self, dist: &str) -> PathBuf {
        self.dists_dir().join(format!("{}.tar", dist))
    }

    /// `native-image.properties` shipped in the suite's metadata dir.
    pub fn option_properties(&self) -> PathBuf {
        self.path
            .join(format!("mx.{}", self.name))
            .join(crate::layout::PROPERTIES_FILE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SuiteMetadata {
    name: String,
    version: String,
    source_url: String,
    #[serde(default)]
    digest: Option<String>,
    fetched_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBundle {
    pub source_url: String,
    pub digest: Option<String>,
}

/// Remote side of suite resolution.
pub trait SuiteSource {
    /// Head commit of `branch` in `repo_url`, `None` when the branch is absent.
    fn resolve_branch(&self, repo_url: &str, branch: &str) -> Result<Option<String>>;

    /// Materializes `name` at `version` into the empty directory `dest`.
    fn fetch(&self, name: &str, version: &str, dest: &Path) -> Result<FetchedBundle>;
}

/// `git ls-remote` for branch heads, HTTP snapshots for bundles.
pub struct RemoteSuiteSource {
    runner: ProcessRunner,
    snapshot_url: String,
    client: reqwest::blocking::Client,
}

impl RemoteSuiteSource {
    pub fn new(runner: ProcessRunner, snapshot_url: impl Into<String>) -> Self {
        Self {
            runner,
            snapshot_url: snapshot_url.into(),
            client: reqwest::blocking::Client::new(),
        }
    }

    pub fn bundle_url(&self, name: &str, version: &str) -> String {
        format!(
            "{}/{}/{}/{}-{}.tar.gz",
            self.snapshot_url.trim_end_matches('/'),
            name,
            version,
            name,
            version
        )
    }
}

/// First token of the first `ls-remote` line.
pub fn parse_ls_remote(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .find(|sha| sha.len() >= 7 && sha.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
}

impl SuiteSource for RemoteSuiteSource {
    fn resolve_branch(&self, repo_url: &str, branch: &str) -> Result<Option<String>> {
        let outcome = self.runner.run(
            ProcessInvocation::new("git")
                .args(["ls-remote", repo_url, &format!("refs/heads/{}", branch)])
                .capture(CaptureMode::Capture)
                .allow_failure(),
        )?;
        if !outcome.success() {
            warn!(repo = repo_url, status = %outcome.status, "git ls-remote failed");
            return Ok(None);
        }
        Ok(parse_ls_remote(&outcome.stdout))
    }

    fn fetch(&self, name: &str, version: &str, dest: &Path) -> Result<FetchedBundle> {
        let url = self.bundle_url(name, version);
        info!(url = %url, "downloading suite bundle");
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| GateError::resolution(&url, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GateError::resolution(&url, format!("HTTP {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .map_err(|e| GateError::resolution(&url, e.to_string()))?;
        let digest = sha256_bytes(&bytes);
        let mut bundle = tempfile::Builder::new().suffix(".tar.gz").tempfile()?;
        std::io::Write::write_all(&mut bundle, &bytes)?;
        extract_archive(bundle.path(), dest)?;
        Ok(FetchedBundle {
            source_url: url,
            digest: Some(digest),
        })
    }
}

pub struct SuiteResolver {
    root: PathBuf,
    repo_url_template: String,
    source: Box<dyn SuiteSource>,
    cache: HashMap<String, ResolvedSuite>,
    states: HashMap<String, SuiteState>,
}

impl SuiteResolver {
    /// `repo_url_template` contains `{repo}`.
    pub fn new(root: impl Into<PathBuf>, repo_url_template: impl Into<String>, source: Box<dyn SuiteSource>) -> Self {
        Self {
            root: root.into(),
            repo_url_template: repo_url_template.into(),
            source,
            cache: HashMap::new(),
            states: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self, name: &str) -> SuiteState {
        self.states
            .get(name)
            .copied()
            .unwrap_or(SuiteState::Unresolved)
    }

    pub fn repo_url(&self, repo: &str) -> String {
        self.repo_url_template.replace("{repo}", repo)
    }

    fn suite_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn local_copy(&self, name: &str) -> Option<ResolvedSuite> {
        let dir = self.suite_dir(name);
        if !dir.is_dir() {
            return None;
        }
        let meta = fs::read(dir.join(METADATA_FILE))
            .ok()
            .and_then(|b| serde_json::from_slice::<SuiteMetadata>(&b).ok());
        Some(match meta {
            Some(m) => ResolvedSuite {
                name: m.name,
                version: m.version,
                source_url: m.source_url,
                path: dir,
            },
            None => ResolvedSuite {
                name: name.to_string(),
                version: "local".to_string(),
                source_url: dir.display().to_string(),
                path: dir,
            },
        })
    }

    /// Resolves `name`. `repo` names the repository when it differs from the
    /// suite name.
    pub fn resolve(&mut self, name: &str, explicit: Option<&str>, repo: Option<&str>) -> Result<ResolvedSuite> {
        if explicit.is_none() {
            if let Some(hit) = self.cache.get(name) {
                return Ok(hit.clone());
            }
        }
        self.states.insert(name.to_string(), SuiteState::Resolving);
        let result = self.resolve_uncached(name, explicit, repo);
        match &result {
            Ok(resolved) => {
                self.states.insert(name.to_string(), SuiteState::Resolved);
                self.cache.insert(name.to_string(), resolved.clone());
            }
            Err(_) => {
                self.states.insert(name.to_string(), SuiteState::Failed);
            }
        }
        result
    }

    fn resolve_uncached(&self, name: &str, explicit: Option<&str>, repo: Option<&str>) -> Result<ResolvedSuite> {
        let local = self.local_copy(name);
        let version = match explicit {
            Some(v) => {
                if let Some(local) = local.filter(|l| l.version == v) {
                    info!(suite = name, version = v, "using local suite copy");
                    return Ok(local);
                }
                v.to_string()
            }
            None => {
                if let Some(local) = local {
                    info!(suite = name, version = %local.version, "using local suite copy");
                    return Ok(local);
                }
                let repo_url = self.repo_url(repo.unwrap_or(name));
                match self.source.resolve_branch(&repo_url, BINARY_BRANCH) {
                    Ok(Some(head)) => head,
                    Ok(None) => {
                        return Err(GateError::resolution(
                            &repo_url,
                            format!("resolving '{}' failed and no local copy of {} is available", BINARY_BRANCH, name),
                        ))
                    }
                    Err(err) => {
                        return Err(GateError::resolution(
                            &repo_url,
                            format!("resolving '{}' failed: {:#}", BINARY_BRANCH, err),
                        ))
                    }
                }
            }
        };

        let reference = SuiteReference {
            name: name.to_string(),
            version: Some(version.clone()),
            source_url: self.repo_url(repo.unwrap_or(name)),
            path: None,
        };
        self.materialize(&reference, &version)
    }

    fn materialize(&self, reference: &SuiteReference, version: &str) -> Result<ResolvedSuite> {
        let name = reference.name.as_str();
        ensure_dir(&self.root)?;
        let staging = self.root.join(format!(".{}.partial", name));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        ensure_dir(&staging)?;
        let fetched = match self.source.fetch(name, version, &staging) {
            Ok(f) => f,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                if crate::error::classify(&err).is_some() {
                    return Err(err);
                }
                return Err(GateError::resolution(
                    format!("{}@{}", name, version),
                    format!("{:#}", err),
                ));
            }
        };
        let meta = SuiteMetadata {
            name: name.to_string(),
            version: version.to_string(),
            source_url: fetched.source_url.clone(),
            digest: fetched.digest.clone(),
            fetched_at: Utc::now().to_rfc3339(),
        };
        atomic_write_json_pretty(&staging.join(METADATA_FILE), &serde_json::to_value(&meta)?)?;

        let dest = self.suite_dir(name);
        if dest.exists() {
            fs::remove_dir_all(&dest)
                .with_context(|| format!("failed to replace {}", dest.display()))?;
        }
        fs::rename(&staging, &dest)
            .map_err(|e| anyhow!("failed to move {} into place: {}", name, e))?;
        info!(suite = name, version, digest = ?fetched.digest, "suite resolved");
        Ok(ResolvedSuite {
            name: name.to_string(),
            version: version.to_string(),
            source_url: fetched.source_url,
            path: dest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::test_dir;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Counters {
        branch: Rc<Cell<usize>>,
        fetch: Rc<Cell<usize>>,
    }

    struct StubSource {
        head: Option<String>,
        available: Vec<String>,
        counters: Counters,
    }

    impl SuiteSource for StubSource {
        fn resolve_branch(&self, _repo_url: &str, _branch: &str) -> Result<Option<String>> {
            self.counters.branch.set(self.counters.branch.get() + 1);
            Ok(self.head.clone())
        }

        fn fetch(&self, name: &str, version: &str, dest: &Path) -> Result<FetchedBundle> {
            self.counters.fetch.set(self.counters.fetch.get() + 1);
            if !self.available.iter().any(|v| v == version) {
                return Err(anyhow!("no snapshot for {}", version));
            }
            ensure_dir(&dest.join("dists"))?;
            fs::write(dest.join("dists").join("GRAALJS.jar"), version)?;
            Ok(FetchedBundle {
                source_url: format!("stub://{}/{}", name, version),
                digest: Some(sha256_bytes(version.as_bytes())),
            })
        }
    }

    fn resolver(root: &Path, head: Option<&str>, available: &[&str]) -> (SuiteResolver, Counters) {
        let counters = Counters::default();
        let source = StubSource {
            head: head.map(str::to_string),
            available: available.iter().map(|s| s.to_string()).collect(),
            counters: counters.clone(),
        };
        let r = SuiteResolver::new(root, "https://example.invalid/{repo}.git", Box::new(source));
        (r, counters)
    }

    #[test]
    fn second_resolution_is_memoized() {
        let root = test_dir("suites_memo");
        let (mut r, counters) = resolver(&root, Some("abc1234"), &["abc1234"]);
        let first = r.resolve("graal-js", None, Some("graaljs")).expect("first");
        let second = r.resolve("graal-js", None, Some("graaljs")).expect("second");
        assert_eq!(first, second);
        assert_eq!(counters.fetch.get(), 1);
        assert_eq!(counters.branch.get(), 1);
        assert_eq!(first.version, "abc1234");
        assert_eq!(r.state("graal-js"), SuiteState::Resolved);
        assert_eq!(fs::read_to_string(first.dist_jar("GRAALJS")).expect("jar"), "abc1234");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn existing_local_copy_skips_remote() {
        let root = test_dir("suites_local");
        let (mut r, _) = resolver(&root, Some("abc1234"), &["abc1234"]);
        r.resolve("sulong", None, None).expect("fetch");

        let (mut fresh, counters) = resolver(&root, None, &[]);
        let local = fresh.resolve("sulong", None, None).expect("local");
        assert_eq!(local.version, "abc1234");
        assert_eq!(counters.branch.get(), 0);
        assert_eq!(counters.fetch.get(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_branch_resolution_names_the_repository() {
        let root = test_dir("suites_branch");
        let (mut r, counters) = resolver(&root, None, &[]);
        let err = r.resolve("graal-js", None, Some("graaljs")).expect_err("no branch");
        assert_eq!(crate::error::classify(&err).map(GateError::kind), Some("resolution_failure"));
        assert!(err.to_string().contains("https://example.invalid/graaljs.git"));
        assert_eq!(counters.fetch.get(), 0);
        assert_eq!(r.state("graal-js"), SuiteState::Failed);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn explicit_version_is_fetched_exactly() {
        let root = test_dir("suites_explicit");
        let (mut r, counters) = resolver(&root, Some("head000"), &["v1", "v2"]);
        let v1 = r.resolve("truffleruby", Some("v1"), None).expect("v1");
        assert_eq!(v1.version, "v1");
        let again = r.resolve("truffleruby", Some("v1"), None).expect("v1 again");
        assert_eq!(again.version, "v1");
        assert_eq!(counters.fetch.get(), 1);
        let v2 = r.resolve("truffleruby", Some("v2"), None).expect("v2");
        assert_eq!(v2.version, "v2");
        assert_eq!(counters.fetch.get(), 2);
        assert_eq!(counters.branch.get(), 0);

        let err = r.resolve("truffleruby", Some("v9"), None).expect_err("missing");
        assert!(err.to_string().contains("truffleruby@v9"));
        assert!(!root.join(".truffleruby.partial").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn ls_remote_output_parsing() {
        assert_eq!(
            parse_ls_remote("0123456789abcdef0123456789abcdef01234567\trefs/heads/binary\n"),
            Some("0123456789abcdef0123456789abcdef01234567".to_string())
        );
        assert_eq!(parse_ls_remote(""), None);
    }
}
