//! `gate.yaml` project configuration.
//!
//! Every section is optional; defaults mirror the distributions and tool
//! names the compiler and native-image suites ship with.

use crate::GateError;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "gate.yaml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GateConfig {
    pub jdk: JdkSection,
    /// Command prefix used for operations delegated to the external build tool.
    pub build_tool: Vec<String>,
    pub output_root: Option<PathBuf>,
    pub distributions: BTreeMap<String, DistributionSpec>,
    pub projects: BTreeMap<String, PathBuf>,
    pub jvmci_classpath: Option<Vec<String>>,
    pub bootclasspath_appends: Option<Vec<String>>,
    pub vm: VmSection,
    pub unittest: UnittestSection,
    pub native_image: NativeImageSection,
    pub suites: SuitesSection,
    pub benchmarks: BenchmarksSection,
    pub ci: CiSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JdkSection {
    pub home: Option<PathBuf>,
    pub compliance: Option<u32>,
    pub modules: Option<Vec<String>>,
    /// Minimum `jvmci-X.Y` version, e.g. `"0.46"`.
    pub min_jvmci_version: Option<String>,
    pub jvmci_packages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DistributionSpec {
    pub path: PathBuf,
    pub sources: Option<PathBuf>,
    /// Java module name when the jar is deployed on the module path.
    pub module: Option<String>,
    /// Other distributions this one requires on the module path.
    pub modulepath: Vec<String>,
    pub overlaps: Vec<String>,
    /// Third-party library (no sources jar).
    pub library: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VmSection {
    pub prefix: Option<String>,
    pub options_file: Option<PathBuf>,
    pub agent_args: Vec<String>,
    pub strip_jars: bool,
    pub proguard_classpath: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnittestSection {
    pub classpath: Vec<String>,
    pub main_class: String,
}

impl Default for UnittestSection {
    fn default() -> Self {
        Self {
            classpath: Vec::new(),
            main_class: "com.oracle.mxtool.junit.MxJUnitWrapper".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolSpec {
    pub image_deps: Vec<String>,
    pub builder_deps: Vec<String>,
    pub native_deps: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageSpec {
    pub flag: String,
    pub suite: String,
    #[serde(default)]
    pub jars: Vec<String>,
    #[serde(default)]
    pub native: Vec<String>,
    /// Repository name when it differs from the suite name.
    #[serde(default)]
    pub repo: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NativeImageSection {
    pub root: Option<PathBuf>,
    pub svm_dir: Option<PathBuf>,
    pub properties_dir: Option<PathBuf>,
    pub sdk_distributions: Option<Vec<String>>,
    pub launcher_distributions: Option<Vec<String>>,
    pub graal_distributions: Option<Vec<String>>,
    pub truffle_distributions: Option<Vec<String>>,
    pub svm_distributions: Option<Vec<String>>,
    pub library_support: Option<Vec<String>>,
    pub clibraries: Vec<PathBuf>,
    /// Copy jars into the layout instead of symlinking them.
    pub copy_jars: bool,
    pub tools: Option<BTreeMap<String, ToolSpec>>,
    pub languages: Option<Vec<LanguageSpec>>,
    pub tutorial_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SuitesSection {
    pub root: Option<PathBuf>,
    pub snapshot_url: Option<String>,
    pub repo_url_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BenchmarksSection {
    pub dacapo_jar: Option<PathBuf>,
    pub scala_dacapo_jar: Option<PathBuf>,
    pub js_benchmarks_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CiSection {
    pub hocon_files: Vec<PathBuf>,
    pub travis_file: PathBuf,
}

impl Default for CiSection {
    fn default() -> Self {
        Self {
            hocon_files: Vec::new(),
            travis_file: PathBuf::from(".travis.yml"),
        }
    }
}

pub const DEFAULT_SNAPSHOT_URL: &str = "https://curio.ssw.jku.at/nexus/content/repositories/snapshots";
pub const DEFAULT_REPO_URL_TEMPLATE: &str = "https://github.com/graalvm/{repo}.git";

impl GateConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&data).map_err(|e| anyhow!("{}: {}", path.display(), e))
    }

    pub fn parse(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data)
            .map_err(|e| GateError::config(format!("invalid {}: {}", CONFIG_FILE_NAME, e)))
    }

    pub fn output_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(
            self.output_root
                .clone()
                .unwrap_or_else(|| PathBuf::from("mxbuild")),
        )
    }

    pub fn distribution(&self, name: &str) -> Result<&DistributionSpec> {
        let key = strip_suite_prefix(name);
        self.distributions
            .get(key)
            .ok_or_else(|| GateError::config(format!("unknown distribution: {}", name)))
    }

    pub fn jvmci_classpath_defaults(&self) -> Vec<String> {
        self.jvmci_classpath
            .clone()
            .unwrap_or_else(|| vec!["GRAAL".to_string()])
    }

    pub fn bootclasspath_defaults(&self) -> Vec<String> {
        self.bootclasspath_appends
            .clone()
            .unwrap_or_else(|| vec!["GRAAL_SDK".to_string(), "TRUFFLE_API".to_string()])
    }

    pub fn snapshot_url(&self) -> String {
        self.suites
            .snapshot_url
            .clone()
            .unwrap_or_else(|| DEFAULT_SNAPSHOT_URL.to_string())
    }

    pub fn repo_url(&self, repo: &str) -> String {
        self.suites
            .repo_url_template
            .as_deref()
            .unwrap_or(DEFAULT_REPO_URL_TEMPLATE)
            .replace("{repo}", repo)
    }
}

/// `suite:DIST` names refer to `DIST` in the flat distribution table.
pub fn strip_suite_prefix(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, d)| d).unwrap_or(name)
}

pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(p) = cur {
        if p.join(CONFIG_FILE_NAME).is_file() {
            return Some(p.to_path_buf());
        }
        cur = p.parent();
    }
    None
}
