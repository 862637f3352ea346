//! De-obfuscation of captured VM output.
//!
//! Stripped jars ship a sibling `<jar>.map` ProGuard mapping. When a process
//! launch references such jars, its output is captured and passed through a
//! [`Retracer`]. Any failure here is logged and dropped.

use crate::args::PATH_SEP;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{info, warn};

pub const BEGIN_MARKER: &str = ">>>> BEGIN UNSTRIPPED OUTPUT";
pub const END_MARKER: &str = "<<<< END UNSTRIPPED OUTPUT";

/// Collects `<piece>.map` files for every argument piece split on the path
/// separator and `=`.
pub fn find_map_files(args: &[String]) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    for arg in args {
        for piece in arg.split(|c: char| c == PATH_SEP || c == '=') {
            if piece.is_empty() {
                continue;
            }
            let candidate = PathBuf::from(format!("{}.map", piece));
            if candidate.is_file() {
                found.insert(candidate);
            }
        }
    }
    found.into_iter().collect()
}

pub trait Retracer: Send + Sync {
    fn retrace(&self, map_files: &[PathBuf], text: &str) -> Result<String>;
}

/// Runs `retracer` over `raw`. Returns the transformed text only when it
/// differs from the input; errors are logged and swallowed.
pub fn unstrip_output(retracer: &dyn Retracer, map_files: &[PathBuf], raw: &str) -> Option<String> {
    if map_files.is_empty() || raw.is_empty() {
        return None;
    }
    match retracer.retrace(map_files, raw) {
        Ok(text) if text != raw => {
            info!("{}", BEGIN_MARKER);
            info!("{}", text);
            info!("{}", END_MARKER);
            Some(text)
        }
        Ok(_) => None,
        Err(err) => {
            warn!(
                "error unstripping output from VM execution with stripped jars: {:#}",
                err
            );
            None
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ClassMapping {
    original: String,
    methods: HashMap<String, BTreeSet<String>>,
}

/// In-process ProGuard mapping reader.
#[derive(Debug, Default, Clone)]
pub struct MappingRetracer;

impl MappingRetracer {
    fn load(map_files: &[PathBuf]) -> Result<HashMap<String, ClassMapping>> {
        let mut classes = HashMap::new();
        for file in map_files {
            let data = fs::read_to_string(file)
                .with_context(|| format!("failed to read mapping {}", file.display()))?;
            parse_mapping(&data, &mut classes);
        }
        Ok(classes)
    }
}

fn parse_mapping(data: &str, classes: &mut HashMap<String, ClassMapping>) {
    let mut current: Option<String> = None;
    for line in data.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');
        let Some((lhs, rhs)) = line.trim().split_once(" -> ") else {
            continue;
        };
        if !indented {
            let obf = rhs.trim_end_matches(':').trim().to_string();
            classes.insert(
                obf.clone(),
                ClassMapping {
                    original: lhs.trim().to_string(),
                    methods: HashMap::new(),
                },
            );
            current = Some(obf);
            continue;
        }
        // Member lines: `[a:b:]type name(args)[:c:d] -> obf`; fields have no parens.
        let Some(paren) = lhs.find('(') else {
            continue;
        };
        let head = &lhs[..paren];
        let Some(name) = head.rsplit(' ').next() else {
            continue;
        };
        if let Some(cls) = current.as_ref().and_then(|c| classes.get_mut(c)) {
            cls.methods
                .entry(rhs.trim().to_string())
                .or_default()
                .insert(name.to_string());
        }
    }
}

impl Retracer for MappingRetracer {
    fn retrace(&self, map_files: &[PathBuf], text: &str) -> Result<String> {
        let classes = Self::load(map_files)?;
        let ident = Regex::new(r"[A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)+")?;
        let out = ident.replace_all(text, |caps: &regex::Captures| {
            let token = &caps[0];
            if let Some(cls) = classes.get(token) {
                return cls.original.clone();
            }
            if let Some((owner, member)) = token.rsplit_once('.') {
                if let Some(cls) = classes.get(owner) {
                    let member = cls
                        .methods
                        .get(member)
                        .map(|names| names.iter().cloned().collect::<Vec<_>>().join("|"))
                        .unwrap_or_else(|| member.to_string());
                    return format!("{}.{}", cls.original, member);
                }
            }
            token.to_string()
        });
        Ok(out.into_owned())
    }
}

/// Runs `proguard.retrace.ReTrace` over temp copies of the output and the
/// concatenated mappings.
#[derive(Debug, Clone)]
pub struct ProguardRetrace {
    pub java: PathBuf,
    pub classpath: String,
}

impl Retracer for ProguardRetrace {
    fn retrace(&self, map_files: &[PathBuf], text: &str) -> Result<String> {
        let mut input = tempfile::NamedTempFile::new()?;
        input.write_all(text.as_bytes())?;
        input.flush()?;
        let mut mapping = tempfile::NamedTempFile::new()?;
        for file in map_files {
            mapping.write_all(&fs::read(file)?)?;
        }
        mapping.flush()?;

        let output = Command::new(&self.java)
            .arg("-cp")
            .arg(&self.classpath)
            .arg("proguard.retrace.ReTrace")
            .arg(mapping.path())
            .arg(input.path())
            .output()
            .with_context(|| format!("failed to run {}", self.java.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "ReTrace exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Picks the external ReTrace when a ProGuard classpath is configured.
pub fn default_retracer(java: &Path, proguard_classpath: Option<&str>) -> Arc<dyn Retracer> {
    match proguard_classpath {
        Some(cp) if !cp.is_empty() => Arc::new(ProguardRetrace {
            java: java.to_path_buf(),
            classpath: cp.to_string(),
        }),
        _ => Arc::new(MappingRetracer),
    }
}
