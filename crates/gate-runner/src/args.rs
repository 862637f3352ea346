//! VM argument pipeline.
//!
//! Every stage takes an argument vector and returns a new one. The stages run
//! in a fixed order: placeholder expansion, default prefix, classpath dedup,
//! JVMCI deployment (module path merge or JDK 8 class path flags).

use crate::GateError;
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

#[cfg(windows)]
pub const PATH_SEP: char = ';';
#[cfg(not(windows))]
pub const PATH_SEP: char = ':';

const CLASSPATH_FLAGS: [&str; 3] = ["-cp", "-classpath", "--class-path"];
const TERMINAL_FLAGS: [&str; 2] = ["-version", "--version"];

#[derive(Debug, Clone, Default)]
pub struct ArgDefaults {
    /// Instrumentation agent arguments (e.g. a coverage agent).
    pub agent_args: Vec<String>,
    /// Compiler options file passed as `-Dgraal.options.file=` when it exists.
    pub options_file: Option<PathBuf>,
}

/// Module path entries, split by whether they shadow a JDK module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModulePlan {
    pub primary: Vec<String>,
    pub upgrade: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JvmciDeployment {
    Jdk8 {
        jvmci_class_path: Vec<String>,
        boot_append: Vec<String>,
    },
    Modules(ModulePlan),
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentHints {
    /// Project name to on-disk output directory, for `@name` placeholders.
    pub projects: BTreeMap<String, PathBuf>,
    pub deployment: Option<JvmciDeployment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltArgs {
    pub args: Vec<String>,
    /// Arguments after a terminal flag such as `-version`.
    pub ignored: Vec<String>,
}

pub fn build_args(
    raw: &[String],
    defaults: &ArgDefaults,
    hints: &EnvironmentHints,
) -> Result<BuiltArgs> {
    let expanded = expand_placeholders(raw, &hints.projects);
    let prefixed = prepend_defaults(&expanded, defaults);
    let deduped = dedup_classpath(&prefixed);
    let args = match &hints.deployment {
        None => deduped,
        Some(JvmciDeployment::Modules(plan)) => merge_module_path(&deduped, plan)?,
        Some(JvmciDeployment::Jdk8 {
            jvmci_class_path,
            boot_append,
        }) => apply_jdk8_class_path(&deduped, jvmci_class_path, boot_append),
    };
    let ignored = dead_args(&args);
    if !ignored.is_empty() {
        warn!(
            ignored = %ignored.join(" "),
            "the following options will be ignored by the VM because they come after the '-version' argument"
        );
    }
    Ok(BuiltArgs { args, ignored })
}

/// Replaces `@project` and `key=@project` tokens with the project's output
/// directory. Unknown names are left untouched.
pub fn expand_placeholders(args: &[String], projects: &BTreeMap<String, PathBuf>) -> Vec<String> {
    let lookup = |name: &str| projects.get(name).map(|p| p.display().to_string());
    args.iter()
        .map(|arg| {
            if let Some(name) = arg.strip_prefix('@') {
                if let Some(path) = lookup(name) {
                    return path;
                }
            } else if let Some((key, value)) = arg.split_once('=') {
                if let Some(path) = value.strip_prefix('@').and_then(lookup) {
                    return format!("{}={}", key, path);
                }
            }
            arg.clone()
        })
        .collect()
}

pub fn prepend_defaults(args: &[String], defaults: &ArgDefaults) -> Vec<String> {
    let mut out = defaults.agent_args.clone();
    if let Some(file) = defaults.options_file.as_ref().filter(|f| f.is_file()) {
        out.push(format!("-Dgraal.options.file={}", file.display()));
    }
    out.extend(args.iter().cloned());
    out
}

/// Location of the first classpath-bearing argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClasspathSlot {
    /// `-cp VALUE`: the value is at `index + 1`.
    Separate(usize),
    /// `--class-path=VALUE` at `index`.
    Inline(usize),
}

pub fn find_classpath_arg(args: &[String]) -> Option<ClasspathSlot> {
    for (idx, arg) in args.iter().enumerate() {
        if CLASSPATH_FLAGS.contains(&arg.as_str()) {
            if idx + 1 < args.len() {
                return Some(ClasspathSlot::Separate(idx));
            }
            return None;
        }
        if arg.starts_with("--class-path=") {
            return Some(ClasspathSlot::Inline(idx));
        }
    }
    None
}

pub fn classpath_value(args: &[String]) -> Option<&str> {
    match find_classpath_arg(args)? {
        ClasspathSlot::Separate(i) => Some(args[i + 1].as_str()),
        ClasspathSlot::Inline(i) => args[i].split_once('=').map(|(_, v)| v),
    }
}

/// Returns a copy of `args` with the classpath value replaced by `f(value)`.
pub fn map_classpath<F>(args: &[String], f: F) -> Vec<String>
where
    F: FnOnce(&str) -> String,
{
    let mut out = args.to_vec();
    match find_classpath_arg(args) {
        Some(ClasspathSlot::Separate(i)) => out[i + 1] = f(&args[i + 1]),
        Some(ClasspathSlot::Inline(i)) => {
            let value = args[i].split_once('=').map(|(_, v)| v).unwrap_or("");
            out[i] = format!("--class-path={}", f(value));
        }
        None => {}
    }
    out
}

pub fn split_path_list(value: &str) -> Vec<String> {
    value
        .split(PATH_SEP)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_path_list(entries: &[String]) -> String {
    entries.join(&PATH_SEP.to_string())
}

/// First-seen-wins dedup that preserves order.
pub fn uniqify(entries: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        if seen.insert(entry.as_str()) {
            out.push(entry.clone());
        }
    }
    out
}

pub fn dedup_classpath(args: &[String]) -> Vec<String> {
    map_classpath(args, |cp| join_path_list(&uniqify(&split_path_list(cp))))
}

fn find_path_option(args: &[String], flag: &str) -> Option<(usize, bool)> {
    let inline = format!("{}=", flag);
    args.iter().enumerate().find_map(|(i, a)| {
        if a == flag && i + 1 < args.len() {
            Some((i, false))
        } else if a.starts_with(&inline) {
            Some((i, true))
        } else {
            None
        }
    })
}

fn path_option_entries(args: &[String], flag: &str) -> Vec<String> {
    match find_path_option(args, flag) {
        Some((i, false)) => split_path_list(&args[i + 1]),
        Some((i, true)) => split_path_list(&args[i][flag.len() + 1..]),
        None => Vec::new(),
    }
}

/// Extends `flag`'s value in place with `additions`, or inserts `flag VALUE`
/// at the front when the option is absent.
fn extend_path_option(args: Vec<String>, flag: &str, additions: &[String]) -> Vec<String> {
    if additions.is_empty() {
        return args;
    }
    match find_path_option(&args, flag) {
        Some((i, inline)) => {
            let mut entries = path_option_entries(&args, flag);
            entries.extend(additions.iter().cloned());
            let merged = join_path_list(&uniqify(&entries));
            let mut out = args;
            if inline {
                out[i] = format!("{}={}", flag, merged);
            } else {
                out[i + 1] = merged;
            }
            out
        }
        None => {
            let mut out = vec![flag.to_string(), join_path_list(&uniqify(additions))];
            out.extend(args);
            out
        }
    }
}

/// Merges a module plan into `args`. Applying the same plan twice gives the
/// same vector as applying it once.
pub fn merge_module_path(args: &[String], plan: &ModulePlan) -> Result<Vec<String>> {
    let upgrade: HashSet<&str> = plan.upgrade.iter().map(String::as_str).collect();
    if let Some(both) = plan.primary.iter().find(|e| upgrade.contains(e.as_str())) {
        return Err(GateError::config(format!(
            "{} cannot be on both --module-path and --upgrade-module-path",
            both
        )));
    }

    for flag in ["--module-path", "--upgrade-module-path"] {
        if args.last().map(String::as_str) == Some(flag) {
            return Err(GateError::config(format!("{} expects a value", flag)));
        }
    }

    let out = extend_path_option(args.to_vec(), "--module-path", &plan.primary);
    let out = extend_path_option(out, "--upgrade-module-path", &plan.upgrade);

    let final_upgrade = path_option_entries(&out, "--upgrade-module-path");
    if let Some(both) = path_option_entries(&out, "--module-path")
        .iter()
        .find(|e| final_upgrade.contains(*e))
    {
        return Err(GateError::config(format!(
            "{} cannot be on both --module-path and --upgrade-module-path",
            both
        )));
    }
    Ok(out)
}

/// Prepends the JDK 8 JVMCI class path flags unless the caller set them.
pub fn apply_jdk8_class_path(
    args: &[String],
    jvmci_class_path: &[String],
    boot_append: &[String],
) -> Vec<String> {
    let mut prefix = Vec::new();
    let has = |p: &str| args.iter().any(|a| a.starts_with(p));
    if !jvmci_class_path.is_empty() && !has("-Djvmci.class.path.append=") {
        prefix.push(format!(
            "-Djvmci.class.path.append={}",
            join_path_list(jvmci_class_path)
        ));
    }
    if !boot_append.is_empty() && !has("-Xbootclasspath/a:") {
        prefix.push(format!("-Xbootclasspath/a:{}", join_path_list(boot_append)));
    }
    prefix.extend(args.iter().cloned());
    prefix
}

pub fn dead_args(args: &[String]) -> Vec<String> {
    args.iter()
        .position(|a| TERMINAL_FLAGS.contains(&a.as_str()))
        .map(|i| args[i + 1..].to_vec())
        .unwrap_or_default()
}
