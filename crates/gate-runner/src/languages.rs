//! Truffle language bundles for the native-image layout.
//!
//! A language is named by its `--language:<flag>` flag and lives in the
//! suite of the same descriptor. Ensuring a language resolves the suite and
//! places its jars and native archives under `languages/<flag>`.

use crate::config::{LanguageSpec, NativeImageSection};
use crate::context::GateContext;
use crate::layout::{link_properties, option_properties_source, ArtifactLayout, Placement};
use crate::suites::ResolvedSuite;
use crate::GateError;
use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageDescriptor {
    pub flag: String,
    pub suite: String,
    pub jars: Vec<String>,
    pub native: Vec<String>,
    /// Repository name when it differs from the suite name.
    pub repo: Option<String>,
}

impl LanguageDescriptor {
    fn new(flag: &str, suite: &str, jars: &[&str], native: &[&str], repo: Option<&str>) -> Self {
        let owned = |list: &[&str]| -> Vec<String> { list.iter().map(|s| s.to_string()).collect() };
        Self {
            flag: flag.to_string(),
            suite: suite.to_string(),
            jars: owned(jars),
            native: owned(native),
            repo: repo.map(str::to_string),
        }
    }
}

impl From<&LanguageSpec> for LanguageDescriptor {
    fn from(spec: &LanguageSpec) -> Self {
        Self {
            flag: spec.flag.clone(),
            suite: spec.suite.clone(),
            jars: spec.jars.clone(),
            native: spec.native.clone(),
            repo: spec.repo.clone(),
        }
    }
}

pub fn default_languages() -> Vec<LanguageDescriptor> {
    vec![
        LanguageDescriptor::new("llvm", "sulong", &["SULONG", "SULONG_LAUNCHER"], &["SULONG_LIBS", "SULONG_DOC"], None),
        LanguageDescriptor::new(
            "js",
            "graal-js",
            &["GRAALJS", "TREGEX", "GRAALJS_LAUNCHER", "ICU4J"],
            &["ICU4J-DIST"],
            Some("graaljs"),
        ),
        LanguageDescriptor::new(
            "ruby",
            "truffleruby",
            &[
                "TRUFFLERUBY",
                "TRUFFLERUBY-LAUNCHER",
                "TRUFFLERUBY-SHARED",
                "TRUFFLERUBY-ANNOTATIONS",
            ],
            &["TRUFFLERUBY-ZIP"],
            None,
        ),
        LanguageDescriptor::new(
            "python",
            "graalpython",
            &["GRAALPYTHON", "GRAALPYTHON-LAUNCHER", "GRAALPYTHON-ENV"],
            &["GRAALPYTHON-ZIP"],
            None,
        ),
    ]
}

/// Configured descriptors, or the defaults when none are configured.
pub fn language_descriptors(section: &NativeImageSection) -> Vec<LanguageDescriptor> {
    match &section.languages {
        Some(list) => list.iter().map(LanguageDescriptor::from).collect(),
        None => default_languages(),
    }
}

/// Splits `--<kind>:<name>[=<value>]`. The prefix match ignores case.
pub fn extract_target_name(arg: &str, kind: &str) -> Option<(String, Option<String>)> {
    let prefix = format!("--{}:", kind);
    let head = arg.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(&prefix) {
        return None;
    }
    let tail = &arg[prefix.len()..];
    Some(match tail.split_once('=') {
        Some((name, value)) => (name.to_string(), Some(value.to_string())),
        None => (tail.to_string(), None),
    })
}

pub fn version_env_var(flag: &str) -> String {
    format!("TRUFFLE_{}_VERSION", flag.to_ascii_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsureOptions {
    /// Return early when `languages/<flag>` already exists.
    pub early_exit: bool,
    /// When false the language directory must already exist.
    pub extract: bool,
}

impl Default for EnsureOptions {
    fn default() -> Self {
        Self {
            early_exit: false,
            extract: true,
        }
    }
}

pub fn language_dir(native_image_root: &Path, flag: &str) -> PathBuf {
    native_image_root.join("languages").join(flag)
}

/// Makes the language available under `<native_image_root>/languages/<flag>`.
/// Returns `None` on an early exit.
pub fn ensure_language(
    ctx: &mut GateContext,
    native_image_root: &Path,
    flag: &str,
    version: Option<&str>,
    options: EnsureOptions,
) -> Result<Option<ResolvedSuite>> {
    let version = version
        .map(str::to_string)
        .or_else(|| env::var(version_env_var(flag)).ok().filter(|v| !v.is_empty()));
    let descriptor = language_descriptors(&ctx.config.native_image)
        .into_iter()
        .find(|d| d.flag == flag)
        .ok_or_else(|| GateError::config(format!("No truffle-language uses language flag '{}'", flag)))?;

    let dir = language_dir(native_image_root, flag);
    if options.early_exit && dir.exists() {
        debug!(language = flag, "language directory exists, skipping suite import");
        return Ok(None);
    }

    let suite = ctx
        .suites
        .resolve(&descriptor.suite, version.as_deref(), descriptor.repo.as_deref())?;

    if !options.extract {
        if !dir.exists() {
            return Err(GateError::config(format!(
                "language directory '{}' should already exist when not extracting",
                flag
            )));
        }
        return Ok(Some(suite));
    }

    let placement = if ctx.config.native_image.copy_jars {
        Placement::Copy
    } else {
        Placement::Symlink
    };
    let subdir = Path::new("languages").join(flag);
    let mut layout = ArtifactLayout::new();
    for jar in &descriptor.jars {
        let path = suite.dist_jar(jar);
        if !path.is_file() {
            return Err(GateError::resolution(
                format!("{}@{}", suite.name, suite.version),
                format!("missing distribution {}", jar),
            ));
        }
        layout.add(&subdir, path, placement)?;
    }
    for dist in &descriptor.native {
        let path = suite.native_dist(dist);
        if !path.is_file() {
            return Err(GateError::resolution(
                format!("{}@{}", suite.name, suite.version),
                format!("missing native distribution {}", dist),
            ));
        }
        layout.add_extract(&subdir, path)?;
    }
    layout.build(native_image_root)?;

    let own = suite.option_properties();
    let properties = if own.is_file() {
        Some(own)
    } else {
        let props_dir = ctx
            .config
            .native_image
            .properties_dir
            .as_ref()
            .map(|d| ctx.project_root.join(d));
        option_properties_source(props_dir.as_deref(), "languages", flag)
    };
    link_properties(&dir, properties.as_deref())?;
    info!(language = flag, suite = %suite.name, version = %suite.version, "language ready");
    Ok(Some(suite))
}

/// `--language:<flag>[=version=<V>]` arguments in first-seen order; a later
/// argument for the same flag replaces the version.
pub fn parse_language_requests(args: &[String]) -> Vec<(String, Option<String>)> {
    let mut requested: Vec<(String, Option<String>)> = Vec::new();
    for arg in args {
        let Some((flag, value)) = extract_target_name(arg, "language") else {
            continue;
        };
        if flag.is_empty() {
            continue;
        }
        let version = value
            .as_deref()
            .and_then(|v| v.split_once("version=").map(|(_, rest)| rest.to_string()))
            .filter(|v| !v.is_empty());
        match requested.iter_mut().find(|(f, _)| *f == flag) {
            Some(slot) => slot.1 = version,
            None => requested.push((flag, version)),
        }
    }
    requested
}

/// Ensures the requested languages, or every known language when `args`
/// is empty. Returns the flags processed.
pub fn fetch_languages(
    ctx: &mut GateContext,
    native_image_root: &Path,
    args: &[String],
    early_exit: bool,
) -> Result<Vec<String>> {
    let requested = if args.is_empty() {
        language_descriptors(&ctx.config.native_image)
            .into_iter()
            .map(|d| (d.flag, None))
            .collect()
    } else {
        parse_language_requests(args)
    };
    let options = EnsureOptions {
        early_exit,
        extract: true,
    };
    let mut done = Vec::new();
    for (flag, version) in requested {
        ensure_language(ctx, native_image_root, &flag, version.as_deref(), options)?;
        done.push(flag);
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::create_archive;
    use crate::context::tests::context;
    use crate::fsutil::{ensure_dir, test_dir};
    use crate::layout::PROPERTIES_FILE;
    use std::fs;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Lays down a local graal-js checkout in the context's suite cache.
    fn stage_graal_js(root: &Path) -> PathBuf {
        let suite = root.join("mxbuild/suites/graal-js");
        let dists = suite.join("dists");
        ensure_dir(&dists).expect("dists");
        for jar in ["GRAALJS", "TREGEX", "GRAALJS_LAUNCHER", "ICU4J"] {
            fs::write(dists.join(format!("{}.jar", jar)), jar).expect("jar");
        }
        let icu = root.join("icu-src");
        ensure_dir(&icu.join("icu4j")).expect("icu");
        fs::write(icu.join("icu4j/data.dat"), "icu").expect("data");
        create_archive(&icu, &dists.join("ICU4J-DIST.tar"), "").expect("tar");
        ensure_dir(&suite.join("mx.graal-js")).expect("mx dir");
        fs::write(suite.join("mx.graal-js").join(PROPERTIES_FILE), "Args = --js\n").expect("props");
        suite
    }

    #[test]
    fn target_names_are_case_insensitive_and_split_once() {
        assert_eq!(
            extract_target_name("--Language:js=version=1.0=x", "language"),
            Some(("js".to_string(), Some("version=1.0=x".to_string())))
        );
        assert_eq!(
            extract_target_name("--tool:junit", "tool"),
            Some(("junit".to_string(), None))
        );
        assert_eq!(extract_target_name("--tool:junit", "language"), None);
        assert_eq!(extract_target_name("-cp", "language"), None);
        assert_eq!(version_env_var("js"), "TRUFFLE_JS_VERSION");
    }

    #[test]
    fn language_requests_keep_order_and_versions() {
        let reqs = parse_language_requests(&v(&[
            "--language:ruby",
            "--language:js=version=abc123",
            "--tool:junit",
            "--language:ruby=version=r2",
        ]));
        assert_eq!(
            reqs,
            vec![
                ("ruby".to_string(), Some("r2".to_string())),
                ("js".to_string(), Some("abc123".to_string())),
            ]
        );
    }

    #[test]
    fn default_descriptors_cover_four_languages_in_order() {
        let flags: Vec<String> = default_languages().into_iter().map(|d| d.flag).collect();
        assert_eq!(flags, vec!["llvm", "js", "ruby", "python"]);
    }

    #[cfg(unix)]
    #[test]
    fn ensure_lays_out_jars_natives_and_properties() {
        let root = test_dir("lang_ensure");
        stage_graal_js(&root);
        let mut ctx = context(&root, 11);
        let image_root = root.join("native-image-root");

        let suite = ensure_language(&mut ctx, &image_root, "js", None, EnsureOptions::default())
            .expect("ensure")
            .expect("suite");
        assert_eq!(suite.version, "local");
        let dir = language_dir(&image_root, "js");
        assert!(fs::symlink_metadata(dir.join("GRAALJS.jar")).expect("jar").file_type().is_symlink());
        assert_eq!(fs::read_to_string(dir.join("icu4j/data.dat")).expect("native"), "icu");
        assert_eq!(fs::read_to_string(dir.join(PROPERTIES_FILE)).expect("props"), "Args = --js\n");

        let early = ensure_language(
            &mut ctx,
            &image_root,
            "js",
            None,
            EnsureOptions {
                early_exit: true,
                extract: true,
            },
        )
        .expect("early exit");
        assert!(early.is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_flag_and_missing_dir_are_configuration_errors() {
        let root = test_dir("lang_errors");
        stage_graal_js(&root);
        let mut ctx = context(&root, 11);
        let image_root = root.join("native-image-root");

        let err = ensure_language(&mut ctx, &image_root, "cobol", None, EnsureOptions::default())
            .expect_err("unknown");
        assert!(err.to_string().contains("'cobol'"));

        let err = ensure_language(
            &mut ctx,
            &image_root,
            "js",
            None,
            EnsureOptions {
                early_exit: false,
                extract: false,
            },
        )
        .expect_err("missing dir");
        assert_eq!(
            crate::error::classify(&err).map(crate::GateError::kind),
            Some("configuration_error")
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unresolvable_suite_is_a_resolution_error() {
        let root = test_dir("lang_unresolved");
        let mut ctx = context(&root, 11);
        let err = fetch_languages(&mut ctx, &root.join("nir"), &v(&["--language:python"]), false)
            .expect_err("offline");
        assert_eq!(
            crate::error::classify(&err).map(crate::GateError::kind),
            Some("resolution_failure")
        );
        let _ = fs::remove_dir_all(root);
    }
}
