//! Launching the JVMCI-enabled VM and checks on the JDK it runs on.

use crate::args::{build_args, ArgDefaults};
use crate::config::CiSection;
use crate::context::GateContext;
use crate::process::{CaptureMode, ExitOutcome, ProcessInvocation};
use crate::GateError;
use anyhow::{Context, Result};
use regex::Regex;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const JVMCI_PREFIX_ARGS: [&str; 2] = ["-XX:+UnlockExperimentalVMOptions", "-XX:+EnableJVMCI"];

/// Compliance major from `java -version` output: `1.8.0_172` is 8,
/// `11.0.2` is 11.
pub fn parse_java_version(output: &str) -> Option<u32> {
    let re = Regex::new(r#"version "([^"]+)""#).ok()?;
    let version = re.captures(output)?.get(1)?.as_str();
    let mut parts = version.split(|c: char| c == '.' || c == '_' || c == '-' || c == '+');
    let first: u32 = parts.next()?.parse().ok()?;
    if first == 1 {
        parts.next()?.parse().ok()
    } else {
        Some(first)
    }
}

/// `(major, minor)` of the last `jvmci-X.Y` marker in the text.
pub fn parse_jvmci_version(output: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"jvmci-(\d+)\.(\d+)").ok()?;
    let caps = re.captures_iter(output).last()?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

fn parse_min_version(value: &str) -> Result<(u32, u32)> {
    let parsed = value
        .split_once('.')
        .and_then(|(a, b)| Some((a.trim().parse().ok()?, b.trim().parse().ok()?)));
    parsed.ok_or_else(|| GateError::config(format!("invalid jdk.min_jvmci_version: {}", value)))
}

/// Checks `java -version` output against the minimum JVMCI version.
/// JDK 9+ images without a marker are accepted since they carry JVMCI as a
/// module.
pub fn evaluate_jvmci_version(
    version_output: &str,
    compliance: u32,
    minimum: Option<(u32, u32)>,
) -> Result<Option<(u32, u32)>> {
    let found = parse_jvmci_version(version_output);
    match (found, minimum) {
        (None, _) if compliance < 9 => Err(GateError::config(
            "the JDK does not support JVMCI: no jvmci-X.Y marker in `java -version` output",
        )),
        (Some(v), Some(min)) if v < min => Err(GateError::config(format!(
            "JVMCI version jvmci-{}.{} is older than the required jvmci-{}.{}",
            v.0, v.1, min.0, min.1
        ))),
        _ => Ok(found),
    }
}

pub fn check_jvmci_version(ctx: &GateContext) -> Result<()> {
    if env::var("JVMCI_VERSION_CHECK").as_deref() == Ok("ignore") {
        debug!("JVMCI version check disabled by JVMCI_VERSION_CHECK=ignore");
        return Ok(());
    }
    let minimum = ctx
        .config
        .jdk
        .min_jvmci_version
        .as_deref()
        .map(parse_min_version)
        .transpose()?;
    let out = ctx.runner.run(
        ProcessInvocation::new(ctx.jdk.java())
            .arg("-version")
            .capture(CaptureMode::Capture)
            .merge_stderr(),
    )?;
    if let Some((major, minor)) = evaluate_jvmci_version(&out.stdout, ctx.jdk.compliance, minimum)? {
        debug!(version = %format!("jvmci-{}.{}", major, minor), "JVMCI version ok");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XxValue {
    Flag(bool),
    Value(String),
}

/// Last-wins lookup of `-XX:+name`, `-XX:-name` and `-XX:name=value`.
pub fn get_xx_option_value(vm_args: &[String], name: &str) -> Option<XxValue> {
    let plus = format!("-XX:+{}", name);
    let minus = format!("-XX:-{}", name);
    let assign = format!("-XX:{}=", name);
    vm_args.iter().rev().find_map(|arg| {
        if *arg == plus {
            Some(XxValue::Flag(true))
        } else if *arg == minus {
            Some(XxValue::Flag(false))
        } else {
            arg.strip_prefix(&assign).map(|v| XxValue::Value(v.to_string()))
        }
    })
}

/// JVMCI is on by default only on JDK 8 builds with JVMCI.
pub fn is_jvmci_enabled(vm_args: &[String], jdk8: bool) -> bool {
    match get_xx_option_value(vm_args, "EnableJVMCI") {
        Some(XxValue::Flag(b)) => b,
        Some(XxValue::Value(v)) => v == "true",
        None => jdk8,
    }
}

/// Returns true (and warns) when bootstrapping is requested without the
/// JVMCI compiler.
pub fn check_bootstrap_config(args: &[String]) -> bool {
    let bootstrap = args.iter().any(|a| a == "-XX:+BootstrapJVMCI");
    let use_jvmci = args.iter().any(|a| a == "-XX:+UseJVMCICompiler");
    let ignored = bootstrap && !use_jvmci;
    if ignored {
        warn!("-XX:+BootstrapJVMCI is ignored since -XX:+UseJVMCICompiler is not enabled");
    }
    ignored
}

#[derive(Debug, Clone, Default)]
pub struct JavaOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub capture: CaptureMode,
    pub merge_stderr: bool,
    pub allow_failure: bool,
    /// Skip agent args and the options file.
    pub no_default_args: bool,
    /// Output lines starting with one of these are echoed only once.
    pub suppress_duplicates: Vec<String>,
}

impl JavaOptions {
    pub fn captured() -> Self {
        Self {
            capture: CaptureMode::Capture,
            merge_stderr: true,
            ..Self::default()
        }
    }

    pub fn teed() -> Self {
        Self {
            capture: CaptureMode::Tee,
            merge_stderr: true,
            ..Self::default()
        }
    }
}

/// Full command line: VM prefix, `java -server`, JVMCI unlock flags, then the
/// pipeline-processed arguments.
pub fn java_command(ctx: &GateContext, args: &[String], add_default_args: bool) -> Result<Vec<String>> {
    let defaults = if add_default_args {
        ctx.arg_defaults()
    } else {
        ArgDefaults::default()
    };
    let built = build_args(args, &defaults, &ctx.env_hints()?)?;
    let mut vm_args: Vec<String> = JVMCI_PREFIX_ARGS.iter().map(|s| s.to_string()).collect();
    vm_args.extend(built.args);
    check_bootstrap_config(&vm_args);

    let mut command = ctx.vm_prefix().to_vec();
    command.push(ctx.jdk.java().display().to_string());
    command.push("-server".to_string());
    command.extend(vm_args);
    Ok(command)
}

pub fn run_java(ctx: &GateContext, args: &[String], options: JavaOptions) -> Result<ExitOutcome> {
    let command = java_command(ctx, args, !options.no_default_args)?;
    let mut invocation = ProcessInvocation::from_command(&command)?
        .timeout(options.timeout)
        .capture(options.capture);
    if let Some(cwd) = options.cwd {
        invocation = invocation.cwd(cwd);
    }
    if options.merge_stderr {
        invocation = invocation.merge_stderr();
    }
    if options.allow_failure {
        invocation = invocation.allow_failure();
    }
    if !options.suppress_duplicates.is_empty() {
        invocation = invocation.suppress_duplicates(options.suppress_duplicates);
    }
    ctx.runner.run(invocation)
}

/// [`run_java`] with the configured default timeout.
pub fn run_vm(ctx: &GateContext, args: &[String], options: JavaOptions) -> Result<ExitOutcome> {
    let options = JavaOptions {
        timeout: options.timeout.or_else(|| ctx.vm_timeout()),
        ..options
    };
    run_java(ctx, args, options)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiVersion {
    pub version: String,
    pub dev: bool,
    pub location: String,
}

impl CiVersion {
    pub fn label(&self) -> String {
        if self.dev {
            format!("{}-dev", self.version)
        } else {
            self.version.clone()
        }
    }
}

/// Scans uncommented lines for `jvmci-X.Y[-dev]`; all markers in the group
/// must agree.
pub fn grep_jvmci_version(files: &[(PathBuf, String)], group: &str) -> Result<CiVersion> {
    let re = Regex::new(r"jvmci-(?P<version>\d*\.\d*)(?P<dev>-dev)?")?;
    let mut found: Option<CiVersion> = None;
    for (path, text) in files {
        for (idx, line) in text.lines().enumerate() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            let Some(caps) = re.captures_iter(line).last() else {
                continue;
            };
            let current = CiVersion {
                version: caps["version"].to_string(),
                dev: caps.name("dev").is_some(),
                location: format!("{}:{}:    {}", path.display(), idx + 1, line.trim_end()),
            };
            if let Some(prev) = &found {
                if prev.version != current.version || prev.dev != current.dev {
                    return Err(GateError::config(format!(
                        "Multiple JVMCI versions found in {} files:\n  {} in {}\n  {} in {}",
                        group,
                        prev.label(),
                        prev.location,
                        current.label(),
                        current.location
                    )));
                }
            }
            found = Some(current);
        }
    }
    found.ok_or_else(|| GateError::config(format!("No JVMCI version found in {} files!", group)))
}

/// A `-dev` hocon version may be one minor ahead of a released travis one.
pub fn compare_ci_versions(hocon: &CiVersion, travis: &CiVersion) -> Result<()> {
    if hocon.version == travis.version && hocon.dev == travis.dev {
        return Ok(());
    }
    if hocon.dev && !travis.dev {
        let mut parts: Vec<u64> = travis
            .version
            .split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect();
        if let Some(last) = parts.last_mut() {
            *last += 1;
        }
        let next = parts.iter().map(u64::to_string).collect::<Vec<_>>().join(".");
        if next == hocon.version {
            return Ok(());
        }
    }
    Err(GateError::config(format!(
        "Travis and ci.hocon JVMCI versions do not match: {} vs. {}",
        travis.label(),
        hocon.label()
    )))
}

/// `*.hocon` at the root and under `ci*/` directories.
fn discover_hocon_files(project_root: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(project_root)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().map(|x| x == "hocon").unwrap_or(false))
        .filter(|e| {
            e.depth() == 1
                || e.path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().starts_with("ci"))
                    .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();
    out.sort();
    out
}

fn read_all(paths: &[PathBuf]) -> Result<Vec<(PathBuf, String)>> {
    paths
        .iter()
        .map(|p| {
            fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))
                .map(|text| (p.clone(), text))
        })
        .collect()
}

pub fn verify_jvmci_ci_versions(project_root: &Path, ci: &CiSection) -> Result<()> {
    let hocon_paths = if ci.hocon_files.is_empty() {
        discover_hocon_files(project_root)
    } else {
        ci.hocon_files.iter().map(|p| project_root.join(p)).collect()
    };
    let hocon = grep_jvmci_version(&read_all(&hocon_paths)?, "hocon")?;
    let travis = grep_jvmci_version(&read_all(&[project_root.join(&ci.travis_file)])?, "TravisCI")?;
    compare_ci_versions(&hocon, &travis)?;
    info!("JVMCI versions are ok!");
    Ok(())
}
