//! Process-wide orchestration state.
//!
//! One [`GateContext`] is created at startup and threaded through every
//! command. Its registries only grow.

use crate::args::{join_path_list, ArgDefaults, EnvironmentHints, JvmciDeployment, ModulePlan};
use crate::config::{strip_suite_prefix, GateConfig};
use crate::fsutil::shell_split;
use crate::participants::{
    ClasspathStripper, ConfigParticipant, JvmciExports, ParticipantChain, RedundantEntries, VmLaunch,
};
use crate::process::{CaptureMode, ExitOutcome, ProcessInvocation, ProcessRunner};
use crate::suites::{RemoteSuiteSource, SuiteResolver, SuiteSource};
use crate::unstrip::default_retracer;
use crate::vm::parse_java_version;
use crate::GateError;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JdkConfig {
    pub home: PathBuf,
    /// Major version, `8` for `1.8.0_x`.
    pub compliance: u32,
    /// Modules of the JDK image; empty on JDK 8.
    pub modules: BTreeSet<String>,
}

impl JdkConfig {
    pub fn new(home: impl Into<PathBuf>, compliance: u32, modules: BTreeSet<String>) -> Self {
        Self {
            home: home.into(),
            compliance,
            modules,
        }
    }

    pub fn tool(&self, name: &str) -> PathBuf {
        let exe = if cfg!(windows) {
            format!("{}.exe", name)
        } else {
            name.to_string()
        };
        self.home.join("bin").join(exe)
    }

    pub fn java(&self) -> PathBuf {
        self.tool("java")
    }

    pub fn javac(&self) -> PathBuf {
        self.tool("javac")
    }

    pub fn is_jdk8(&self) -> bool {
        self.compliance < 9
    }

    /// `jre/lib/jvmci` of a JDK 8 image.
    pub fn jvmci_dir(&self) -> PathBuf {
        self.home.join("jre").join("lib").join("jvmci")
    }

    pub fn tools_jar(&self) -> PathBuf {
        self.home.join("lib").join("tools.jar")
    }

    /// Configured values only; never launches `java`. Unknown compliance is
    /// `0` and unknown modules are empty.
    pub fn configured(config: &GateConfig) -> Self {
        let home = config
            .jdk
            .home
            .clone()
            .or_else(|| env::var_os("JAVA_HOME").map(PathBuf::from))
            .unwrap_or_default();
        let modules = config.jdk.modules.iter().flatten().cloned().collect();
        JdkConfig::new(home, config.jdk.compliance.unwrap_or(0), modules)
    }

    /// Uses the configured values and falls back to asking the JDK itself.
    pub fn detect(config: &GateConfig, runner: &ProcessRunner) -> Result<Self> {
        let home = config
            .jdk
            .home
            .clone()
            .or_else(|| env::var_os("JAVA_HOME").map(PathBuf::from))
            .ok_or_else(|| GateError::config("no JDK configured: set jdk.home in gate.yaml or JAVA_HOME"))?;
        let mut jdk = JdkConfig::new(home, config.jdk.compliance.unwrap_or(0), BTreeSet::new());
        if jdk.compliance == 0 {
            let out = runner.run(
                ProcessInvocation::new(jdk.java())
                    .arg("-version")
                    .capture(CaptureMode::Capture)
                    .merge_stderr(),
            )?;
            jdk.compliance = parse_java_version(&out.stdout).ok_or_else(|| {
                GateError::config(format!("cannot determine Java version of {}", jdk.home.display()))
            })?;
        }
        jdk.modules = match &config.jdk.modules {
            Some(mods) => mods.iter().cloned().collect(),
            None if !jdk.is_jdk8() => {
                let out = runner.run(
                    ProcessInvocation::new(jdk.java())
                        .arg("--list-modules")
                        .capture(CaptureMode::Capture),
                )?;
                parse_module_list(&out.stdout)
            }
            None => BTreeSet::new(),
        };
        debug!(home = %jdk.home.display(), compliance = jdk.compliance, "detected JDK");
        Ok(jdk)
    }
}

/// `java --list-modules` prints `name@version` per line.
pub fn parse_module_list(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.split('@').next().unwrap_or(l).to_string())
        .collect()
}

#[derive(Default)]
pub struct ContextOptions {
    pub strip_jars: bool,
    /// Overrides `vm.prefix`, e.g. `gdb --args`.
    pub vm_prefix: Option<String>,
    pub extra_vm_args: Vec<String>,
    /// Take the JDK from configuration without running it. For commands
    /// that never start a VM.
    pub skip_jdk_detection: bool,
    /// Replaces the network-backed suite source.
    pub suite_source: Option<Box<dyn SuiteSource>>,
}

pub struct GateContext {
    pub project_root: PathBuf,
    pub config: GateConfig,
    pub jdk: JdkConfig,
    pub runner: ProcessRunner,
    pub suites: SuiteResolver,
    participants: ParticipantChain,
    jvmci_classpath: Vec<String>,
    bootclasspath_appends: Vec<String>,
    vm_prefix: Vec<String>,
    extra_vm_args: Vec<String>,
    redundant: RedundantEntries,
}

impl GateContext {
    pub fn new(project_root: impl Into<PathBuf>, config: GateConfig, jdk: JdkConfig, options: ContextOptions) -> Result<Self> {
        let project_root = project_root.into();
        let strip_jars = options.strip_jars || config.vm.strip_jars;
        let runner = ProcessRunner::new(
            strip_jars,
            default_retracer(&jdk.java(), config.vm.proguard_classpath.as_deref()),
        );
        let prefix_src = options.vm_prefix.clone().or_else(|| config.vm.prefix.clone());
        let vm_prefix = match prefix_src {
            Some(p) => shell_split(&p)?,
            None => Vec::new(),
        };
        let suites_root = config
            .suites
            .root
            .as_ref()
            .map(|r| project_root.join(r))
            .unwrap_or_else(|| config.output_root(&project_root).join("suites"));
        let repo_template = config
            .suites
            .repo_url_template
            .clone()
            .unwrap_or_else(|| crate::config::DEFAULT_REPO_URL_TEMPLATE.to_string());
        let source = match options.suite_source {
            Some(s) => s,
            None => Box::new(RemoteSuiteSource::new(runner.clone(), config.snapshot_url())),
        };
        let suites = SuiteResolver::new(suites_root, repo_template, source);

        let mut ctx = Self {
            project_root,
            jvmci_classpath: config.jvmci_classpath_defaults(),
            bootclasspath_appends: config.bootclasspath_defaults(),
            config,
            jdk,
            runner,
            suites,
            participants: ParticipantChain::new(),
            vm_prefix,
            extra_vm_args: options.extra_vm_args,
            redundant: RedundantEntries::default(),
        };
        if let Err(err) = ctx.refresh_redundant_entries() {
            warn!("classpath stripping is unavailable: {:#}", err);
        }
        let stripper = ClasspathStripper::shared(ctx.redundant.clone());
        ctx.register_participant(Box::new(stripper));
        let packages = ctx
            .config
            .jdk
            .jvmci_packages
            .clone()
            .unwrap_or_else(JvmciExports::default_packages);
        ctx.register_participant(Box::new(JvmciExports::new(packages, ctx.jdk.compliance)));
        Ok(ctx)
    }

    /// Loads `gate.yaml` from `project_root` and detects the JDK unless
    /// `options.skip_jdk_detection` is set.
    pub fn load(project_root: &Path, options: ContextOptions) -> Result<Self> {
        let path = project_root.join(crate::config::CONFIG_FILE_NAME);
        let config = if path.is_file() {
            GateConfig::load(&path)?
        } else {
            GateConfig::default()
        };
        let jdk = if options.skip_jdk_detection {
            JdkConfig::configured(&config)
        } else {
            JdkConfig::detect(&config, &ProcessRunner::default())?
        };
        Self::new(project_root, config, jdk, options)
    }

    pub fn register_participant(&mut self, participant: Box<dyn ConfigParticipant>) {
        self.participants.register(participant);
    }

    pub fn participants(&self) -> &ParticipantChain {
        &self.participants
    }

    pub fn apply_participants(&self, launch: VmLaunch) -> Result<VmLaunch> {
        self.participants.apply(launch)
    }

    fn require_jar_distribution(&self, name: &str) -> Result<()> {
        let spec = self.config.distribution(name)?;
        let is_jar = spec
            .path
            .extension()
            .map(|e| e == "jar" || e == "zip")
            .unwrap_or(false);
        if !is_jar {
            return Err(GateError::config(format!("{} is not a jar distribution", name)));
        }
        Ok(())
    }

    pub fn add_jvmci_classpath_entry(&mut self, name: &str) -> Result<()> {
        self.require_jar_distribution(name)?;
        self.jvmci_classpath.push(name.to_string());
        self.refresh_redundant_entries()
    }

    pub fn add_bootclasspath_append(&mut self, name: &str) -> Result<()> {
        self.require_jar_distribution(name)?;
        self.bootclasspath_appends.push(name.to_string());
        self.refresh_redundant_entries()
    }

    pub fn jvmci_classpath(&self) -> &[String] {
        &self.jvmci_classpath
    }

    pub fn bootclasspath_appends(&self) -> &[String] {
        &self.bootclasspath_appends
    }

    pub fn vm_prefix(&self) -> &[String] {
        &self.vm_prefix
    }

    pub fn extra_vm_args(&self) -> &[String] {
        &self.extra_vm_args
    }

    pub fn vm_timeout(&self) -> Option<Duration> {
        self.config.vm.timeout_secs.map(Duration::from_secs)
    }

    pub fn output_root(&self) -> PathBuf {
        self.config.output_root(&self.project_root)
    }

    pub fn distribution_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.project_root.join(&self.config.distribution(name)?.path))
    }

    /// Distribution jar for a name, or a project output directory.
    pub fn entry_path(&self, name: &str) -> Result<PathBuf> {
        if let Some(dir) = self.config.projects.get(strip_suite_prefix(name)) {
            return Ok(self.project_root.join(dir));
        }
        self.distribution_path(name)
    }

    pub fn classpath(&self, names: &[String]) -> Result<String> {
        let entries = names
            .iter()
            .map(|n| self.entry_path(n).map(|p| p.display().to_string()))
            .collect::<Result<Vec<_>>>()?;
        Ok(join_path_list(&entries))
    }

    /// Distributions reachable from `roots` through `modulepath` deps, in
    /// first-seen order.
    fn module_closure(&self, roots: &[String]) -> Result<Vec<String>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<String> = roots.iter().rev().cloned().collect();
        while let Some(name) = stack.pop() {
            let key = strip_suite_prefix(&name).to_string();
            if !seen.insert(key.clone()) {
                continue;
            }
            let spec = self.config.distribution(&key)?;
            for dep in spec.modulepath.iter().rev() {
                stack.push(dep.clone());
            }
            out.push(key);
        }
        Ok(out)
    }

    fn deployed_distributions(&self) -> Vec<String> {
        let mut all = self.jvmci_classpath.clone();
        all.extend(self.bootclasspath_appends.iter().cloned());
        all
    }

    /// Jar paths already provided by the JVMCI class path or boot class path.
    fn redundant_classpath_entries(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for name in self.module_closure(&self.deployed_distributions())? {
            let spec = self.config.distribution(&name)?;
            out.push(self.project_root.join(&spec.path).display().to_string());
            for overlap in &spec.overlaps {
                out.push(self.distribution_path(overlap)?.display().to_string());
            }
        }
        Ok(out)
    }

    /// Recomputes the entries the classpath stripper removes. On failure the
    /// stripper refuses to run until a later refresh succeeds.
    fn refresh_redundant_entries(&self) -> Result<()> {
        match self.redundant_classpath_entries() {
            Ok(entries) => {
                self.redundant.set(entries);
                Ok(())
            }
            Err(err) => {
                self.redundant.set_unresolved(format!("{:#}", err));
                Err(err)
            }
        }
    }

    /// Splits deployed distributions into primary and upgrade module path
    /// entries. A distribution whose module the JDK already contains goes on
    /// the upgrade path.
    pub fn module_plan(&self) -> Result<ModulePlan> {
        let mut plan = ModulePlan::default();
        for name in self.module_closure(&self.deployed_distributions())? {
            let spec = self.config.distribution(&name)?;
            let path = self.project_root.join(&spec.path).display().to_string();
            match &spec.module {
                Some(module) if self.jdk.modules.contains(module) => plan.upgrade.push(path),
                _ => plan.primary.push(path),
            }
        }
        Ok(plan)
    }

    pub fn deployment(&self) -> Result<JvmciDeployment> {
        if self.jdk.is_jdk8() {
            let paths = |names: &[String]| -> Result<Vec<String>> {
                names
                    .iter()
                    .map(|n| self.distribution_path(n).map(|p| p.display().to_string()))
                    .collect()
            };
            Ok(JvmciDeployment::Jdk8 {
                jvmci_class_path: paths(&self.jvmci_classpath)?,
                boot_append: paths(&self.bootclasspath_appends)?,
            })
        } else {
            Ok(JvmciDeployment::Modules(self.module_plan()?))
        }
    }

    pub fn arg_defaults(&self) -> ArgDefaults {
        ArgDefaults {
            agent_args: self.config.vm.agent_args.clone(),
            options_file: self
                .config
                .vm
                .options_file
                .as_ref()
                .map(|f| self.project_root.join(f)),
        }
    }

    pub fn env_hints(&self) -> Result<EnvironmentHints> {
        let projects: BTreeMap<String, PathBuf> = self
            .config
            .projects
            .iter()
            .map(|(k, v)| (k.clone(), self.project_root.join(v)))
            .collect();
        Ok(EnvironmentHints {
            projects,
            deployment: Some(self.deployment()?),
        })
    }

    /// Runs `<build_tool> args...` in the project root.
    pub fn run_build_tool(&self, args: &[String]) -> Result<ExitOutcome> {
        if self.config.build_tool.is_empty() {
            return Err(GateError::config("no build_tool configured in gate.yaml"));
        }
        let mut command = self.config.build_tool.clone();
        command.extend(args.iter().cloned());
        let invocation = ProcessInvocation::from_command(&command)?.cwd(&self.project_root);
        self.runner.run(invocation)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::suites::FetchedBundle;
    use anyhow::anyhow;
    use std::fs;

    pub(crate) struct OfflineSource;

    impl SuiteSource for OfflineSource {
        fn resolve_branch(&self, _repo_url: &str, _branch: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn fetch(&self, _name: &str, _version: &str, _dest: &Path) -> Result<FetchedBundle> {
            Err(anyhow!("offline"))
        }
    }

    pub(crate) const CONFIG: &str = r#"
build_tool: [mx]
jvmci_classpath: [GRAAL]
bootclasspath_appends: [GRAAL_SDK, TRUFFLE_API]
distributions:
  GRAAL:
    path: dists/graal.jar
    module: jdk.internal.vm.compiler
    modulepath: [GRAAL_SDK]
    overlaps: [GRAAL_OLD]
  GRAAL_OLD:
    path: dists/graal-old.jar
  GRAAL_SDK:
    path: dists/graal-sdk.jar
    module: org.graalvm.graal_sdk
  TRUFFLE_API:
    path: dists/truffle-api.jar
    module: com.oracle.truffle.truffle_api
  SVM_NATIVE:
    path: dists/svm-native.tar
projects:
  org.graalvm.compiler.test: out/test
"#;

    pub(crate) fn context(root: &Path, compliance: u32) -> GateContext {
        context_from(root, compliance, CONFIG)
    }

    pub(crate) fn context_from(root: &Path, compliance: u32, yaml: &str) -> GateContext {
        context_with(root, compliance, yaml, Some("gdb --args"))
    }

    pub(crate) fn context_with(root: &Path, compliance: u32, yaml: &str, vm_prefix: Option<&str>) -> GateContext {
        let config = GateConfig::parse(yaml).expect("config");
        let modules: BTreeSet<String> = if compliance >= 9 {
            ["java.base", "jdk.internal.vm.ci", "jdk.internal.vm.compiler"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            BTreeSet::new()
        };
        let jdk = JdkConfig::new(root.join("jdk"), compliance, modules);
        GateContext::new(
            root,
            config,
            jdk,
            ContextOptions {
                vm_prefix: vm_prefix.map(str::to_string),
                suite_source: Some(Box::new(OfflineSource)),
                ..ContextOptions::default()
            },
        )
        .expect("context")
    }

    #[test]
    fn default_participants_are_registered_in_order() {
        let root = PathBuf::from("/work");
        let ctx = context(&root, 11);
        assert_eq!(ctx.participants().names(), vec!["classpath-stripper", "jvmci-exports"]);
        assert_eq!(ctx.vm_prefix(), ["gdb", "--args"]);
    }

    #[test]
    fn module_plan_separates_jdk_shadowing_modules() {
        let root = PathBuf::from("/work");
        let ctx = context(&root, 11);
        let plan = ctx.module_plan().expect("plan");
        assert_eq!(plan.upgrade, vec!["/work/dists/graal.jar"]);
        assert_eq!(plan.primary, vec!["/work/dists/graal-sdk.jar", "/work/dists/truffle-api.jar"]);
    }

    #[test]
    fn jdk8_deployment_uses_class_path_lists() {
        let root = PathBuf::from("/work");
        let ctx = context(&root, 8);
        match ctx.deployment().expect("deployment") {
            JvmciDeployment::Jdk8 {
                jvmci_class_path,
                boot_append,
            } => {
                assert_eq!(jvmci_class_path, vec!["/work/dists/graal.jar"]);
                assert_eq!(boot_append.len(), 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn stripper_removes_deployed_jars_and_overlaps() {
        let root = PathBuf::from("/work");
        let ctx = context(&root, 11);
        let launch = VmLaunch::new(
            vec![
                "-cp".to_string(),
                join_path_list(&[
                    "/work/app.jar".to_string(),
                    "/work/dists/graal-old.jar".to_string(),
                    "/work/dists/truffle-api.jar".to_string(),
                ]),
            ],
            "Main",
            Vec::new(),
        );
        let out = ctx.apply_participants(launch).expect("apply");
        assert_eq!(out.vm_args[1], "/work/app.jar");
    }

    #[test]
    fn registration_requires_jar_distribution() {
        let root = PathBuf::from("/work");
        let mut ctx = context(&root, 11);
        assert!(ctx.add_bootclasspath_append("NOPE").is_err());
        assert!(ctx.add_bootclasspath_append("SVM_NATIVE").is_err());
        ctx.add_jvmci_classpath_entry("GRAAL_OLD").expect("jar");
        assert_eq!(ctx.jvmci_classpath(), ["GRAAL", "GRAAL_OLD"]);
    }

    #[test]
    fn stripper_sees_entries_added_later() {
        let yaml = CONFIG.replace(
            "  SVM_NATIVE:\n",
            "  POLYGLOT:\n    path: dists/polyglot.jar\n  SVM_NATIVE:\n",
        );
        let root = PathBuf::from("/work");
        let mut ctx = context_from(&root, 11, &yaml);
        let launch = || {
            VmLaunch::new(
                vec![
                    "-cp".to_string(),
                    join_path_list(&["/work/app.jar".to_string(), "/work/dists/polyglot.jar".to_string()]),
                ],
                "Main",
                Vec::new(),
            )
        };
        let before = ctx.apply_participants(launch()).expect("apply");
        assert!(before.vm_args[1].contains("polyglot.jar"));

        ctx.add_bootclasspath_append("POLYGLOT").expect("append");
        let after = ctx.apply_participants(launch()).expect("apply");
        assert_eq!(after.vm_args[1], "/work/app.jar");
        assert!(ctx
            .module_plan()
            .expect("plan")
            .primary
            .contains(&"/work/dists/polyglot.jar".to_string()));
    }

    #[test]
    fn misconfigured_deployment_fails_the_launch() {
        let yaml = CONFIG.replace("    overlaps: [GRAAL_OLD]\n", "    overlaps: [GRAAL_MISSING]\n");
        let root = PathBuf::from("/work");
        let ctx = context_from(&root, 11, &yaml);
        let launch = VmLaunch::new(vec!["-cp".to_string(), "/work/app.jar".to_string()], "Main", Vec::new());
        let err = ctx.apply_participants(launch).expect_err("unresolved");
        assert_eq!(crate::error::classify(&err).map(GateError::kind), Some("configuration_error"));
        assert!(format!("{:#}", err).contains("GRAAL_MISSING"));
    }

    #[test]
    fn load_without_jdk_detection_never_runs_java() {
        let root = crate::fsutil::test_dir("context_no_jdk");
        fs::write(
            root.join(crate::config::CONFIG_FILE_NAME),
            "jdk:\n  home: /nonexistent/jdk\nbuild_tool: [mx]\n",
        )
        .expect("config");
        let offline = || ContextOptions {
            suite_source: Some(Box::new(OfflineSource)),
            ..ContextOptions::default()
        };
        let err = GateContext::load(&root, offline()).err().expect("detection runs java");
        assert_eq!(crate::error::classify(&err).map(GateError::kind), Some("configuration_error"));

        let ctx = GateContext::load(
            &root,
            ContextOptions {
                skip_jdk_detection: true,
                ..offline()
            },
        )
        .expect("config only");
        assert_eq!(ctx.jdk.home, PathBuf::from("/nonexistent/jdk"));
        assert_eq!(ctx.jdk.compliance, 0);
        assert!(ctx.jdk.modules.is_empty());
        assert_eq!(ctx.config.build_tool, vec!["mx".to_string()]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn module_list_parsing_drops_versions() {
        let mods = parse_module_list("java.base@11.0.2\njdk.internal.vm.ci@11.0.2\n\n");
        assert!(mods.contains("java.base"));
        assert!(mods.contains("jdk.internal.vm.ci"));
        assert_eq!(mods.len(), 2);
    }
}
