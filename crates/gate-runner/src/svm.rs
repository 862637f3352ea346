//! Native image support: the `native-image` launcher bootstrap, its
//! directory layout, and the demos and smoke tests built with it.

use crate::config::{strip_suite_prefix, NativeImageSection};
use crate::context::GateContext;
use crate::fsutil::{ensure_dir, relsymlink, remove_existing_symlink};
use crate::languages::{ensure_language, language_dir, EnsureOptions};
use crate::layout::{link_properties, option_properties_source, ArtifactLayout, Placement};
use crate::participants::CompilerFlags;
use crate::process::{CaptureMode, ExitOutcome, ExitStatusKind, ProcessInvocation, ProcessRunner};
use crate::vm::{run_java, JavaOptions};
use crate::GateError;
use anyhow::{anyhow, Result};
use regex::Regex;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NATIVE_IMAGE: &str = "native-image";
pub const IMAGE_ASSERTION_FLAGS: [&str; 3] = ["-H:+VerifyGraalGraphs", "-H:+VerifyGraalGraphEdges", "-H:+VerifyPhases"];
pub const HOSTED_ASSERTIONS: [&str; 2] = ["-J-ea", "-J-esa"];
pub const TEST_RUN_TIMEOUT: Duration = Duration::from_secs(10);
const SVM_VERSION: &str = "dev";

pub fn host_os() -> &'static str {
    match env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

pub fn host_arch() -> &'static str {
    match env::consts::ARCH {
        "x86_64" => "amd64",
        other => other,
    }
}

pub fn host_os_supported() -> bool {
    matches!(host_os(), "linux" | "darwin")
}

/// `<os>-<arch>`, e.g. `linux-amd64`.
pub fn platform_subdir() -> String {
    format!("{}-{}", host_os(), host_arch())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    /// Added to the image class path when the tool is requested.
    pub image_deps: Vec<String>,
    /// Added to the image builder class path.
    pub builder_deps: Vec<String>,
    /// Archives extracted into `tools/<name>`.
    pub native_deps: Vec<String>,
}

impl ToolDescriptor {
    fn new(name: &str, image: &[&str], builder: &[&str], native: &[&str]) -> Self {
        let owned = |list: &[&str]| -> Vec<String> { list.iter().map(|s| s.to_string()).collect() };
        Self {
            name: name.to_string(),
            image_deps: owned(image),
            builder_deps: owned(builder),
            native_deps: owned(native),
        }
    }
}

pub fn default_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new("truffle", &[], &["truffle:TRUFFLE_NFI"], &["truffle:TRUFFLE_NFI_NATIVE"]),
        ToolDescriptor::new("native-image", &["substratevm:SVM_DRIVER"], &[], &[]),
        ToolDescriptor::new("junit", &[], &["mx:JUNIT_TOOL", "JUNIT", "HAMCREST"], &[]),
        ToolDescriptor::new("nfi", &[], &[], &[]),
        ToolDescriptor::new("chromeinspector", &["tools:CHROMEINSPECTOR"], &[], &[]),
        ToolDescriptor::new("profiler", &["tools:TRUFFLE_PROFILER"], &[], &[]),
    ]
}

pub fn tool_descriptors(section: &NativeImageSection) -> Vec<ToolDescriptor> {
    match &section.tools {
        Some(map) => map
            .iter()
            .map(|(name, spec)| ToolDescriptor {
                name: name.clone(),
                image_deps: spec.image_deps.clone(),
                builder_deps: spec.builder_deps.clone(),
                native_deps: spec.native_deps.clone(),
            })
            .collect(),
        None => default_tools(),
    }
}

fn group(configured: &Option<Vec<String>>, default: &[&str]) -> Vec<String> {
    configured
        .clone()
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

/// Distribution groups that make up the launcher layout.
#[derive(Debug, Clone)]
pub struct DistributionGroups {
    pub sdk: Vec<String>,
    pub launcher: Vec<String>,
    pub graal: Vec<String>,
    pub truffle: Vec<String>,
    pub svm: Vec<String>,
    pub library_support: Vec<String>,
}

impl DistributionGroups {
    pub fn from_section(section: &NativeImageSection) -> Self {
        Self {
            sdk: group(&section.sdk_distributions, &["sdk:GRAAL_SDK"]),
            launcher: group(&section.launcher_distributions, &["sdk:LAUNCHER_COMMON"]),
            graal: group(&section.graal_distributions, &["compiler:GRAAL"]),
            truffle: group(&section.truffle_distributions, &["truffle:TRUFFLE_API"]),
            svm: group(&section.svm_distributions, &["substratevm:SVM"]),
            library_support: group(&section.library_support, &["substratevm:LIBRARY_SUPPORT"]),
        }
    }
}

/// Where the launcher and its layout live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvmPaths {
    /// Directory that receives the `native-image` links.
    pub svm_dir: PathBuf,
    pub native_image_root: PathBuf,
    pub clibraries: Vec<PathBuf>,
}

impl SvmPaths {
    pub fn from_context(ctx: &GateContext) -> Self {
        let section = &ctx.config.native_image;
        let svm_dir = section
            .svm_dir
            .as_ref()
            .map(|d| ctx.project_root.join(d))
            .unwrap_or_else(|| ctx.project_root.clone());
        let native_image_root = section
            .root
            .as_ref()
            .map(|d| ctx.project_root.join(d))
            .unwrap_or_else(|| svm_dir.join("svmbuild").join("native-image-root"));
        let clibraries = if section.clibraries.is_empty() {
            vec![svm_dir.join("clibraries")]
        } else {
            section.clibraries.iter().map(|d| ctx.project_root.join(d)).collect()
        };
        Self {
            svm_dir,
            native_image_root,
            clibraries,
        }
    }

    pub fn svmbuild_dir(&self) -> PathBuf {
        self.svm_dir.join("svmbuild")
    }

    pub fn native_image_path(&self) -> PathBuf {
        native_image_path(&self.native_image_root)
    }

    /// `native-image-<platform>` or plain `native-image` next to the suite.
    pub fn symlink_path(&self, platform_specific: bool) -> PathBuf {
        if platform_specific {
            self.svm_dir.join(format!("{}-{}", NATIVE_IMAGE, platform_subdir()))
        } else {
            self.svm_dir.join(NATIVE_IMAGE)
        }
    }

    /// Comma-separated per-platform C library directories.
    pub fn clibrary_libpath(&self) -> String {
        let platform = platform_subdir();
        self.clibraries
            .iter()
            .map(|d| d.join(&platform).display().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn native_image_path(native_image_root: &Path) -> PathBuf {
    native_image_root.join(platform_subdir()).join("bin").join(NATIVE_IMAGE)
}

/// Registers the host compiler flags for launches made by native-image
/// commands.
pub fn register_participants(ctx: &mut GateContext) {
    ctx.register_participant(Box::new(CompilerFlags::new()));
}

/// Java arguments that run the image generator on the launcher itself.
pub fn bootstrap_command(ctx: &GateContext, paths: &SvmPaths) -> Result<Vec<String>> {
    let groups = DistributionGroups::from_section(&ctx.config.native_image);
    let mut image_dists = groups.svm.clone();
    image_dists.push("substratevm:SVM_DRIVER".to_string());
    let launcher = paths.native_image_path();
    let launcher_dir = launcher
        .parent()
        .ok_or_else(|| anyhow!("launcher path has no parent: {}", launcher.display()))?;

    let mut cmd = CompilerFlags::new().flags();
    cmd.extend(
        [
            "-Duser.country=US".to_string(),
            "-Duser.language=en".to_string(),
            format!("-Dsubstratevm.version={}:substratevm", SVM_VERSION),
            "-Dgraalvm.version=dev".to_string(),
            "-cp".to_string(),
            ctx.classpath(&groups.svm)?,
            "com.oracle.svm.hosted.NativeImageGeneratorRunner".to_string(),
            "-imagecp".to_string(),
            ctx.classpath(&image_dists)?,
            format!("-H:CLibraryPath={}", paths.clibrary_libpath()),
            format!("-H:Path={}", launcher_dir.display()),
            "-H:Class=com.oracle.svm.driver.NativeImage".to_string(),
            format!("-H:Name={}", NATIVE_IMAGE),
            "-H:-ParseRuntimeOptions".to_string(),
        ],
    );
    if ctx.runner.strip_jars() {
        cmd.push("-H:-VerifyNamingConventions".to_string());
    }
    Ok(cmd)
}

fn add_distributions(
    ctx: &GateContext,
    layout: &mut ArtifactLayout,
    subdir: &Path,
    names: &[String],
    placement: Placement,
) -> Result<()> {
    for name in names {
        let spec = ctx.config.distribution(name)?;
        layout.add(subdir, ctx.project_root.join(&spec.path), placement)?;
        if !spec.library {
            if let Some(sources) = &spec.sources {
                layout.add(subdir, ctx.project_root.join(sources), placement)?;
            }
        }
    }
    Ok(())
}

fn extract_distributions(ctx: &GateContext, layout: &mut ArtifactLayout, subdir: &Path, names: &[String]) -> Result<()> {
    for name in names {
        layout.add_extract(subdir, ctx.distribution_path(name)?)?;
    }
    Ok(())
}

/// Populates the launcher layout under the native-image root. Returns the
/// placed entries.
pub fn assemble_layout(ctx: &GateContext, paths: &SvmPaths) -> Result<Vec<PathBuf>> {
    let section = &ctx.config.native_image;
    let groups = DistributionGroups::from_section(section);
    let tools = tool_descriptors(section);
    let placement = if section.copy_jars {
        Placement::Copy
    } else {
        Placement::Symlink
    };
    let mut layout = ArtifactLayout::new();

    add_distributions(ctx, &mut layout, Path::new("lib/boot"), &groups.sdk, placement)?;
    add_distributions(ctx, &mut layout, Path::new("lib/graalvm"), &groups.launcher, placement)?;
    let jvmci = Path::new("lib/jvmci");
    add_distributions(ctx, &mut layout, jvmci, &groups.graal, placement)?;
    let jdk_jvmci = ctx.jdk.jvmci_dir();
    if jdk_jvmci.is_dir() {
        let mut entries: Vec<PathBuf> = fs::read_dir(&jdk_jvmci)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        layout.add_all(jvmci, entries, Placement::Symlink)?;
    }
    add_distributions(ctx, &mut layout, Path::new("lib/truffle"), &groups.truffle, placement)?;

    for tool in &tools {
        let dir = Path::new("tools").join(&tool.name);
        add_distributions(ctx, &mut layout, &dir.join("builder"), &tool.builder_deps, placement)?;
        add_distributions(ctx, &mut layout, &dir, &tool.image_deps, placement)?;
        extract_distributions(ctx, &mut layout, &dir, &tool.native_deps)?;
    }

    let svm = Path::new("lib/svm");
    add_distributions(ctx, &mut layout, svm, &groups.library_support, placement)?;
    let mut builder = groups.svm.clone();
    builder.push("substratevm:POINTSTO".to_string());
    builder.push("substratevm:OBJECTFILE".to_string());
    add_distributions(ctx, &mut layout, &svm.join("builder"), &builder, placement)?;
    for dir in &paths.clibraries {
        if dir.is_dir() {
            layout.add_tree(svm.join("clibraries"), dir)?;
        }
    }

    let placed = layout.build(&paths.native_image_root)?;

    let props_dir = section.properties_dir.as_ref().map(|d| ctx.project_root.join(d));
    for tool in &tools {
        if let Some(source) = option_properties_source(props_dir.as_deref(), "tools", &tool.name) {
            let dir = paths.native_image_root.join("tools").join(&tool.name);
            link_properties(&dir, Some(&source))?;
        }
    }
    Ok(placed)
}

/// Links `native-image-<platform>` and `native-image` to the launcher.
pub fn link_launcher(paths: &SvmPaths) -> Result<()> {
    let launcher = paths.native_image_path();
    for platform_specific in [true, false] {
        let link = paths.symlink_path(platform_specific);
        remove_existing_symlink(&link)?;
        relsymlink(&launcher, &link)?;
    }
    Ok(())
}

/// Builds the launcher and its layout. Returns false when the platform link
/// already exists.
pub fn bootstrap_native_image(ctx: &GateContext, paths: &SvmPaths) -> Result<bool> {
    let link = paths.symlink_path(true);
    if fs::symlink_metadata(&link).is_ok() {
        debug!(link = %link.display(), "native-image already bootstrapped");
        return Ok(false);
    }
    let command = bootstrap_command(ctx, paths)?;
    run_java(ctx, &command, JavaOptions::default())?;
    debug!(launcher = %paths.native_image_path().display(), "built launcher");
    let placed = assemble_layout(ctx, paths)?;
    link_launcher(paths)?;
    info!(root = %paths.native_image_root.display(), entries = placed.len(), "native-image bootstrapped");
    Ok(true)
}

/// `--warning-as-error` without `--force-javac` cannot produce a usable
/// launcher.
pub fn bootstrap_allowed(args: &[String]) -> bool {
    let has = |flag: &str| args.iter().any(|a| a == flag);
    !(has("--warning-as-error") && !has("--force-javac"))
}

pub fn build(ctx: &GateContext, paths: &SvmPaths, args: &[String]) -> Result<()> {
    let mut command = vec!["build".to_string()];
    command.extend(args.iter().cloned());
    if args.iter().any(|a| a == "-h" || a == "--help") {
        ctx.run_build_tool(&command)?;
        return Ok(());
    }
    info!("build: checking SubstrateVM requirements");
    if !host_os_supported() {
        return Err(GateError::config(
            "build: SubstrateVM can be built only on Darwin and Linux platforms",
        ));
    }
    ctx.run_build_tool(&command)?;
    if bootstrap_allowed(args) {
        bootstrap_native_image(ctx, paths)?;
    } else {
        debug!("--warning-as-error without --force-javac, skipping native-image bootstrap");
    }
    Ok(())
}

/// Text after `option` up to the next space, from the first line that has it.
pub fn parse_dry_run_option(output: &str, option: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, after) = line.split_once(option)?;
        Some(after.split(' ').next().unwrap_or_default().trim_end().to_string())
    })
}

/// An open `native-image` build server session. The server is wiped when the
/// session opens and shut down when it is dropped.
pub struct NativeImage {
    runner: ProcessRunner,
    binary: PathBuf,
    base_args: Vec<String>,
}

impl NativeImage {
    pub fn open(runner: ProcessRunner, binary: PathBuf, base_args: Vec<String>) -> Result<Self> {
        runner.run(ProcessInvocation::new(&binary).arg("--server-wipe"))?;
        Ok(Self {
            runner,
            binary,
            base_args,
        })
    }

    /// Session for the gate: output under `svmbuild`, hosted assertions on,
    /// plus `common_args`.
    pub fn for_context(ctx: &GateContext, paths: &SvmPaths, common_args: &[String], verbose: bool) -> Result<Self> {
        let mut base = vec![format!("-H:Path={}", paths.svmbuild_dir().display())];
        if verbose {
            base.push("--verbose".to_string());
        }
        base.extend(HOSTED_ASSERTIONS.iter().map(|s| s.to_string()));
        base.extend(common_args.iter().cloned());
        Self::open(ctx.runner.clone(), paths.native_image_path(), base)
    }

    pub fn base_args(&self) -> &[String] {
        &self.base_args
    }

    fn query(&self, all_args: &[String], option: &str) -> Result<String> {
        let out = self.runner.run(
            ProcessInvocation::new(&self.binary)
                .arg("--dry-run")
                .args(all_args.iter().cloned())
                .capture(CaptureMode::Capture),
        )?;
        parse_dry_run_option(&out.stdout, option)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GateError::config(format!("native-image --dry-run did not report {}", option)))
    }

    /// Builds an image and returns its path.
    pub fn build(&self, args: &[String]) -> Result<PathBuf> {
        let mut all_args = self.base_args.clone();
        all_args.extend(args.iter().cloned());
        let path = self.query(&all_args, "-H:Path=")?;
        let name = self.query(&all_args, "-H:Name=")?;
        self.runner
            .run(ProcessInvocation::new(&self.binary).args(all_args))?;
        Ok(PathBuf::from(path).join(name))
    }
}

impl Drop for NativeImage {
    fn drop(&mut self) {
        let shutdown = ProcessInvocation::new(&self.binary)
            .arg("--server-shutdown")
            .allow_failure();
        if let Err(err) = self.runner.run(shutdown) {
            warn!("native-image server shutdown failed: {:#}", err);
        }
    }
}

/// Runs `command` and requires its stdout to equal `expected`.
pub fn test_run(runner: &ProcessRunner, command: &[String], expected: &str, timeout: Duration) -> Result<ExitOutcome> {
    let outcome = runner.run(
        ProcessInvocation::from_command(command)?
            .capture(CaptureMode::Tee)
            .timeout(Some(timeout))
            .allow_failure(),
    )?;
    if outcome.stdout != expected {
        return Err(GateError::output_mismatch(
            command.join(" "),
            outcome.code(),
            format!(
                "stdout does not match expected output: got {:?}, expected {:?}",
                outcome.stdout, expected
            ),
        ));
    }
    Ok(outcome)
}

/// At least one `name: score` line.
pub fn benchmark_output_passes(stdout: &str) -> bool {
    let Ok(re) = Regex::new(r"^\S+: *\d+(\.\d+)?\s*$") else {
        return false;
    };
    stdout.lines().any(|l| re.is_match(l))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsBenchmark {
    pub name: String,
    pub warmup_iterations: u32,
    pub iterations: u32,
    pub timeout: Duration,
}

impl JsBenchmark {
    pub fn new(name: &str, warmup_iterations: u32, iterations: u32, timeout_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            warmup_iterations,
            iterations,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

pub fn js_image_test(
    runner: &ProcessRunner,
    binary: &Path,
    bench_dir: &Path,
    bench: &JsBenchmark,
    bin_args: &[String],
) -> Result<()> {
    let mut command = vec![binary.display().to_string()];
    command.extend(bin_args.iter().cloned());
    command.extend([
        bench_dir.join("harness.js").display().to_string(),
        "--".to_string(),
        bench_dir.join(format!("{}.js", bench.name)).display().to_string(),
        "--".to_string(),
        format!("--warmup-iterations={}", bench.warmup_iterations),
        format!("--iterations={}", bench.iterations),
    ]);
    info!("{}", command.join(" "));
    let outcome = runner.run(
        ProcessInvocation::from_command(&command)?
            .cwd(bench_dir)
            .capture(CaptureMode::Tee)
            .timeout(Some(bench.timeout))
            .allow_failure(),
    )?;
    let command_line = command.join(" ");
    let passed = match outcome.status {
        ExitStatusKind::TimedOut => {
            info!("TIMEOUT (> {}s): {}", bench.timeout.as_secs(), bench.name);
            return Err(GateError::Timeout {
                command: command_line,
                timeout: bench.timeout,
            }
            .into());
        }
        ExitStatusKind::Exited(_) => benchmark_output_passes(&outcome.stdout),
        ExitStatusKind::Signaled => false,
    };
    if !passed {
        return Err(GateError::output_mismatch(
            command_line,
            outcome.code(),
            format!("JS benchmark {} failed", bench.name),
        ));
    }
    Ok(())
}

pub fn build_js(ctx: &mut GateContext, image: &NativeImage, paths: &SvmPaths) -> Result<PathBuf> {
    ensure_language(ctx, &paths.native_image_root, "js", None, EnsureOptions::default())?;
    image.build(&["--language:js".to_string(), "--tool:chromeinspector".to_string()])
}

pub fn js_benchmarks_dir(ctx: &GateContext) -> PathBuf {
    match &ctx.config.benchmarks.js_benchmarks_dir {
        Some(dir) => ctx.project_root.join(dir),
        None => ctx.project_root.join("..").join("..").join("js-benchmarks"),
    }
}

pub fn build_python(ctx: &mut GateContext, image: &NativeImage, paths: &SvmPaths) -> Result<PathBuf> {
    ensure_language(ctx, &paths.native_image_root, "llvm", None, EnsureOptions::default())?;
    ensure_language(ctx, &paths.native_image_root, "python", None, EnsureOptions::default())?;
    image.build(&[
        "--language:python".to_string(),
        "--tool:profiler".to_string(),
        "com.oracle.graal.python.shell.GraalPythonMain".to_string(),
        "python".to_string(),
    ])
}

/// Runs a one-line script and checks its greeting.
pub fn python_smoke(runner: &ProcessRunner, python: &Path) -> Result<()> {
    let expected = "Hello from Python";
    let mut script = tempfile::Builder::new().suffix(".py").tempfile()?;
    writeln!(script, "print('{}')", expected)?;
    script.flush()?;
    let outcome = runner.run(
        ProcessInvocation::new(python)
            .arg(script.path().display().to_string())
            .capture(CaptureMode::Capture)
            .allow_failure(),
    )?;
    let command_line = format!("{} {}", python.display(), script.path().display());
    if !outcome.success() {
        return Err(GateError::output_mismatch(
            command_line,
            outcome.code(),
            format!("Python binary failed to execute: {}", outcome.stdout),
        ));
    }
    if outcome.stdout != format!("{}\n", expected) {
        return Err(GateError::output_mismatch(
            command_line,
            outcome.code(),
            format!("Python smoke test failed: {:?}", outcome.stdout),
        ));
    }
    info!("Python binary says: {}", outcome.stdout.trim_end());
    Ok(())
}

pub fn build_ruby(ctx: &mut GateContext, image: &NativeImage, paths: &SvmPaths) -> Result<PathBuf> {
    ensure_language(ctx, &paths.native_image_root, "llvm", None, EnsureOptions::default())?;
    ensure_language(ctx, &paths.native_image_root, "ruby", None, EnsureOptions::default())?;
    // The launcher finds the Ruby home relative to its bin/ dir.
    let bin_dir = language_dir(&paths.native_image_root, "ruby").join("bin");
    image.build(&[
        "--language:ruby".to_string(),
        "-H:Name=truffleruby".to_string(),
        format!("-H:Path={}", bin_dir.display()),
    ])
}

pub fn ruby_smoke(runner: &ProcessRunner, ruby: &Path) -> Result<()> {
    let command = vec![
        ruby.display().to_string(),
        "-e".to_string(),
        "puts 'Hello from Ruby'".to_string(),
    ];
    test_run(runner, &command, "Hello from Ruby\n", TEST_RUN_TIMEOUT).map(|_| ())
}

pub fn build_sulong(ctx: &mut GateContext, image: &NativeImage, paths: &SvmPaths) -> Result<PathBuf> {
    ensure_language(ctx, &paths.native_image_root, "llvm", None, EnsureOptions::default())?;
    image.build(&["--language:llvm".to_string()])
}

pub fn sulong_smoke(runner: &ProcessRunner, lli: &Path) -> Result<()> {
    runner.run(
        ProcessInvocation::new(lli)
            .arg("--version")
            .capture(CaptureMode::Tee)
            .timeout(Some(TEST_RUN_TIMEOUT)),
    )?;
    Ok(())
}

const HELLO_OUTPUT: &str = "Hello from Substrate VM";

/// Builds a javac image, compiles HelloWorld with it, builds HelloWorld
/// into an image and checks what it prints.
pub fn helloworld(ctx: &GateContext, image: &NativeImage, paths: &SvmPaths, args: &[String]) -> Result<()> {
    let hello_dir = paths.svmbuild_dir();
    ensure_dir(&hello_dir)?;
    let hello_path = format!("-H:Path={}", hello_dir.display());

    let mut javac_args = vec![
        hello_path.clone(),
        "-cp".to_string(),
        ctx.jdk.tools_jar().display().to_string(),
        "com.sun.tools.javac.Main".to_string(),
        "javac".to_string(),
        "-H:+ReportUnsupportedElementsAtRuntime".to_string(),
        "-H:IncludeResourceBundles=com.sun.tools.javac.resources.compiler,com.sun.tools.javac.resources.javac,com.sun.tools.javac.resources.version".to_string(),
    ];
    javac_args.extend(args.iter().cloned());
    image.build(&javac_args)?;

    let source = hello_dir.join("HelloWorld.java");
    fs::write(
        &source,
        format!(
            "public class HelloWorld {{ public static void main(String[] args) {{ System.out.println(\"{}\"); }} }}",
            HELLO_OUTPUT
        ),
    )?;
    // No jars in the build dir, so the boot class path is given explicitly.
    ctx.runner.run(
        ProcessInvocation::new(hello_dir.join("javac"))
            .arg("-proc:none")
            .arg("-bootclasspath")
            .arg(ctx.jdk.home.join("jre").join("lib").join("rt.jar").display().to_string())
            .arg(source.display().to_string()),
    )?;

    image.build(&[
        hello_path,
        "-cp".to_string(),
        hello_dir.display().to_string(),
        "HelloWorld".to_string(),
    ])?;
    let hello = hello_dir.join("helloworld");
    let outcome = ctx.runner.run(ProcessInvocation::new(&hello).capture(CaptureMode::Tee))?;
    let expected = format!("{}\n", HELLO_OUTPUT);
    if outcome.stdout != expected {
        return Err(GateError::output_mismatch(
            hello.display().to_string(),
            outcome.code(),
            format!("Wrong output: {:?} != {:?}", outcome.stdout, expected),
        ));
    }
    Ok(())
}

const TUTORIAL_PROJECT: &str = "com.oracle.svm.tutorial";

/// Builds the C interface tutorial as a shared library, links the C driver
/// against it and runs the driver.
pub fn cinterfacetutorial(ctx: &GateContext, image: &NativeImage, paths: &SvmPaths, args: &[String]) -> Result<()> {
    let tutorial_dir = ctx
        .config
        .native_image
        .tutorial_dir
        .as_ref()
        .map(|d| ctx.project_root.join(d))
        .ok_or_else(|| GateError::config("native_image.tutorial_dir is not configured"))?;
    let classes = match ctx.config.projects.get(TUTORIAL_PROJECT) {
        Some(dir) => ctx.project_root.join(dir),
        None => tutorial_dir.join("bin"),
    };
    let build_dir = paths.svmbuild_dir().join(TUTORIAL_PROJECT).join("build");
    if build_dir.exists() {
        fs::remove_dir_all(&build_dir)?;
    }
    ensure_dir(&build_dir)?;

    let mut image_args = vec![
        "-shared".to_string(),
        format!("-H:Path={}", build_dir.display()),
        "-H:Name=libcinterfacetutorial".to_string(),
        format!("-H:CLibraryPath={}", tutorial_dir.display()),
        "-cp".to_string(),
        classes.display().to_string(),
    ];
    image_args.extend(args.iter().cloned());
    image.build(&image_args)?;

    let build = build_dir.display().to_string();
    let exe = build_dir.join("cinterfacetutorial");
    ctx.runner.run(ProcessInvocation::new("cc").args([
        "-g".to_string(),
        tutorial_dir.join("native").join("cinterfacetutorial.c").display().to_string(),
        format!("-I{}", build),
        format!("-L{}", build),
        "-lcinterfacetutorial".to_string(),
        "-ldl".to_string(),
        format!("-Wl,-rpath,{}", build),
        "-o".to_string(),
        exe.display().to_string(),
    ]))?;
    ctx.runner.run(ProcessInvocation::new(exe))?;
    Ok(())
}

/// Delegates to `<build_tool> benchmark`, fetching JavaScript first when the
/// benchmarks run on a native image.
pub fn benchmark(ctx: &mut GateContext, paths: &SvmPaths, args: &[String]) -> Result<()> {
    if args.iter().any(|a| a == "--jsvm=substratevm") {
        ensure_language(ctx, &paths.native_image_root, "js", None, EnsureOptions::default())?;
    }
    let mut command = vec!["benchmark".to_string()];
    command.extend(args.iter().cloned());
    ctx.run_build_tool(&command)?;
    Ok(())
}

/// Distribution names a `--tool:`/`--language:` argument list pulls in.
pub fn image_dependencies(ctx: &GateContext, args: &[String]) -> Vec<String> {
    let tools = tool_descriptors(&ctx.config.native_image);
    let languages = crate::languages::language_descriptors(&ctx.config.native_image);
    let mut deps = Vec::new();
    for arg in args {
        if let Some((name, _)) = crate::languages::extract_target_name(arg, "tool") {
            if let Some(tool) = tools.iter().find(|t| t.name == name) {
                deps.extend(tool.builder_deps.iter().cloned());
                deps.extend(tool.image_deps.iter().cloned());
                deps.extend(tool.native_deps.iter().cloned());
            }
        }
        if let Some((flag, _)) = crate::languages::extract_target_name(arg, "language") {
            if let Some(lang) = languages.iter().find(|l| l.flag == flag) {
                for dist in lang.jars.iter().chain(lang.native.iter()) {
                    deps.push(format!("{}:{}", lang.suite, strip_suite_prefix(dist)));
                }
            }
        }
    }
    deps
}
