//! The gate task catalogue for the compiler and native-image suites.

use crate::compiler::{ctw, javadoc, makegraaljdk, unittest, MakeGraalJdkOptions};
use crate::context::GateContext;
use crate::fsutil::shell_split;
use crate::gate::GateTask;
use crate::process::{CaptureMode, ProcessInvocation};
use crate::svm::{
    bootstrap_native_image, build_js, build_python, build_ruby, build_sulong, cinterfacetutorial, helloworld,
    js_benchmarks_dir, js_image_test, python_smoke, ruby_smoke, sulong_smoke, test_run, JsBenchmark, NativeImage,
    SvmPaths, IMAGE_ASSERTION_FLAGS, TEST_RUN_TIMEOUT,
};
use crate::vm::{run_java, run_vm, verify_jvmci_ci_versions, JavaOptions};
use crate::GateError;
use anyhow::{anyhow, Result};
use regex::Regex;
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{info, warn};

pub mod tags {
    pub const BOOTSTRAP: &[&str] = &["bootstrap", "fulltest"];
    pub const BOOTSTRAP_LITE: &[&str] = &["bootstraplite", "bootstrap", "fulltest"];
    pub const BOOTSTRAP_FULL_VERIFY: &[&str] = &["bootstrapfullverify", "fulltest"];
    pub const TEST: &[&str] = &["test", "fulltest"];
    pub const BENCHMARK_TEST: &[&str] = &["benchmarktest", "fulltest"];
    pub const CTW: &[&str] = &["ctw", "fulltest"];
    pub const DOC: &[&str] = &["javadoc"];
    pub const STYLE: &[&str] = &["style"];

    pub const HELLOWORLD: &[&str] = &["helloworld"];
    pub const JS: &[&str] = &["js"];
    pub const RUBY: &[&str] = &["ruby"];
    pub const PYTHON: &[&str] = &["python"];
    pub const SULONG: &[&str] = &["sulong"];
}

/// Options shared by every gate task.
#[derive(Debug, Clone, Default)]
pub struct GateSettings {
    /// Appended to the VM arguments of compiler tasks.
    pub extra_vm_args: Vec<String>,
    pub verbose: bool,
}

/// Shell-splits each `--extra-vm-argument` value and drops empty words.
pub fn parse_extra_vm_args(raw: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for value in raw {
        out.extend(shell_split(value)?.into_iter().filter(|w| !w.is_empty()));
    }
    Ok(out)
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const DEFAULT_FLAGS: &[&str] = &["-Dgraal.CompilationWatchDogStartDelay=60.0D"];
const ASSERTION_FLAGS: &[&str] = &["-esa"];
const ERROR_FLAGS: &[&str] = &["-Dgraal.CompilationFailureAction=ExitVM"];
const ECONOMY_FLAGS: &[&str] = &["-Dgraal.CompilerConfiguration=economy"];
const VERIFICATION_FLAGS: &[&str] = &[
    "-Dgraal.VerifyGraalGraphs=true",
    "-Dgraal.VerifyGraalGraphEdges=true",
    "-Dgraal.VerifyGraalPhasesSize=true",
    "-Dgraal.VerifyPhases=true",
];
const COOP_FLAGS: &[&str] = &["-XX:-UseCompressedOops"];
const GC_VERIFICATION_FLAGS: &[&str] = &["-XX:+UnlockDiagnosticVMOptions", "-XX:+VerifyBeforeGC", "-XX:+VerifyAfterGC"];
const G1_VERIFICATION_FLAGS: &[&str] = &["-XX:-UseSerialGC", "-XX:+UseG1GC"];
const EXCEPTION_FLAGS: &[&str] = &["-Dgraal.StressInvokeWithExceptionNode=true"];
const REGISTER_PRESSURE_FLAGS: &[&str] = &["-Dgraal.RegisterPressure=rbx,r11,r10,r14,xmm3,xmm11,xmm14"];
const IMMUTABLE_CODE_FLAGS: &[&str] = &["-Dgraal.ImmutableCode=true", "-Dgraal.VerifyPhases=true"];
const GC_VERIFY_SUPPRESS: &[&str] = &["VerifyAfterGC:", "VerifyBeforeGC:"];

/// A VM bootstrap with the JVMCI compiler under a given flag set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapTest {
    pub name: &'static str,
    pub args: Vec<String>,
    pub tags: &'static [&'static str],
    /// Output prefixes echoed only once.
    pub suppress: Vec<String>,
}

impl BootstrapTest {
    fn new(name: &'static str, groups: &[&[&str]], tags: &'static [&'static str], suppress: &[&str]) -> Self {
        let mut args: Vec<String> = owned(DEFAULT_FLAGS);
        for group in groups {
            args.extend(owned(group));
        }
        args.extend(owned(ERROR_FLAGS));
        Self {
            name,
            args,
            tags,
            suppress: owned(suppress),
        }
    }

    pub fn command(&self, extra_vm_args: &[String]) -> Vec<String> {
        let mut cmd = self.args.clone();
        cmd.push("-XX:+UseJVMCICompiler".to_string());
        cmd.extend(extra_vm_args.iter().cloned());
        cmd.extend(owned(&["-XX:-TieredCompilation", "-XX:+BootstrapJVMCI", "-version"]));
        cmd
    }
}

pub fn bootstrap_tests() -> Vec<BootstrapTest> {
    vec![
        BootstrapTest::new(
            "BootstrapWithSystemAssertionsFullVerify",
            &[ASSERTION_FLAGS, VERIFICATION_FLAGS],
            tags::BOOTSTRAP_FULL_VERIFY,
            &[],
        ),
        BootstrapTest::new("BootstrapWithSystemAssertions", &[ASSERTION_FLAGS], tags::BOOTSTRAP_LITE, &[]),
        BootstrapTest::new(
            "BootstrapWithSystemAssertionsNoCoop",
            &[ASSERTION_FLAGS, COOP_FLAGS],
            tags::BOOTSTRAP,
            &[],
        ),
        BootstrapTest::new(
            "BootstrapWithGCVerification",
            &[GC_VERIFICATION_FLAGS],
            tags::BOOTSTRAP,
            GC_VERIFY_SUPPRESS,
        ),
        BootstrapTest::new(
            "BootstrapWithG1GCVerification",
            &[G1_VERIFICATION_FLAGS, GC_VERIFICATION_FLAGS],
            tags::BOOTSTRAP,
            GC_VERIFY_SUPPRESS,
        ),
        BootstrapTest::new(
            "BootstrapWithSystemAssertionsEconomy",
            &[ASSERTION_FLAGS, ECONOMY_FLAGS],
            tags::BOOTSTRAP,
            &[],
        ),
        BootstrapTest::new(
            "BootstrapWithSystemAssertionsExceptionEdges",
            &[ASSERTION_FLAGS, EXCEPTION_FLAGS],
            tags::BOOTSTRAP,
            &[],
        ),
        BootstrapTest::new(
            "BootstrapWithSystemAssertionsRegisterPressure",
            &[ASSERTION_FLAGS, REGISTER_PRESSURE_FLAGS],
            tags::BOOTSTRAP,
            &[],
        ),
        BootstrapTest::new(
            "BootstrapWithSystemAssertionsImmutableCode",
            &[ASSERTION_FLAGS, IMMUTABLE_CODE_FLAGS],
            tags::BOOTSTRAP,
            &[],
        ),
    ]
}

pub const DACAPO_SUCCESS: &str = r"^===== DaCapo 9\.12 ([a-zA-Z0-9_]+) PASSED in ([0-9]+) msec =====";
pub const SCALA_DACAPO_SUCCESS: &str =
    r"^===== DaCapo 0\.1\.0(-SNAPSHOT)? ([a-zA-Z0-9_]+) PASSED in ([0-9]+) msec =====";

pub const DACAPO_BENCHMARKS: &[(&str, u32)] = &[
    ("avrora", 1),
    ("batik", 1),
    ("fop", 8),
    ("h2", 1),
    ("jython", 2),
    ("luindex", 1),
    ("lusearch", 4),
    ("pmd", 1),
    ("sunflow", 2),
    ("xalan", 1),
];

pub const SCALA_DACAPO_BENCHMARKS: &[(&str, u32)] = &[
    ("actors", 1),
    ("apparat", 1),
    ("factorie", 1),
    ("kiama", 4),
    ("scalac", 1),
    ("scaladoc", 1),
    ("scalap", 1),
    ("scalariform", 1),
    ("scalatest", 1),
    ("scalaxb", 1),
    ("tmt", 1),
];

/// An `hs_err_pid<N>.log` path mentioned in VM output.
pub fn find_hs_err(output: &str) -> Option<PathBuf> {
    let re = Regex::new(r"(([A-Z]:|/).*[/\\]hs_err_pid[0-9]+\.log)").ok()?;
    re.find(output).map(|m| PathBuf::from(m.as_str()))
}

/// Runs a benchmark VM with merged, teed output. A crash log named in the
/// output is dumped and removed. The run passes when the VM exits cleanly
/// and some line matches `success_re`.
pub fn gate_java_benchmark(ctx: &GateContext, args: &[String], success_re: &str) -> Result<()> {
    let outcome = run_java(
        ctx,
        args,
        JavaOptions {
            allow_failure: true,
            ..JavaOptions::teed()
        },
    )?;
    if let Some(hs_err) = find_hs_err(&outcome.stdout) {
        info!("Dumping {}", hs_err.display());
        match fs::read(&hs_err) {
            Ok(bytes) => {
                info!("{}", String::from_utf8_lossy(&bytes));
                if let Err(err) = fs::remove_file(&hs_err) {
                    warn!("failed to remove {}: {}", hs_err.display(), err);
                }
            }
            Err(err) => warn!("failed to read {}: {}", hs_err.display(), err),
        }
    }
    if !outcome.success() {
        return Err(GateError::ProcessFailure {
            command: args.join(" "),
            code: outcome.code(),
            detail: None,
        }
        .into());
    }
    let re = Regex::new(&format!("(?m){}", success_re))?;
    if !re.is_match(&outcome.stdout) {
        return Err(GateError::output_mismatch(
            args.join(" "),
            outcome.code(),
            format!("Could not find benchmark success pattern: {}", success_re),
        ));
    }
    Ok(())
}

const DACAPO_VM_ARGS: &[&str] = &[
    "-Xms2g",
    "-XX:+UseSerialGC",
    "-XX:-UseCompressedOops",
    "-Djava.net.preferIPv4Stack=true",
    "-Dgraal.CompilationFailureAction=ExitVM",
];

pub fn dacapo_args(jar: &str, name: &str, iterations: u32, extra_vm_args: &[String], scala: bool) -> Vec<String> {
    let mut args: Vec<String> = DACAPO_VM_ARGS
        .iter()
        .filter(|a| !(scala && **a == "-Djava.net.preferIPv4Stack=true"))
        .map(|s| s.to_string())
        .collect();
    args.extend(extra_vm_args.iter().cloned());
    args.extend(["-jar".to_string(), jar.to_string(), name.to_string(), "-n".to_string(), iterations.to_string()]);
    args
}

fn benchmark_jar(ctx: &GateContext, scala: bool) -> Result<String> {
    let (configured, key) = if scala {
        (&ctx.config.benchmarks.scala_dacapo_jar, "scala_dacapo_jar")
    } else {
        (&ctx.config.benchmarks.dacapo_jar, "dacapo_jar")
    };
    configured
        .as_ref()
        .map(|p| ctx.project_root.join(p).display().to_string())
        .ok_or_else(|| GateError::config(format!("benchmarks.{} is not configured", key)))
}

/// Batik refers to a class only the Oracle JDK ships.
fn is_batik_supported(ctx: &GateContext) -> bool {
    let probe = ProcessInvocation::new(ctx.jdk.tool("javap"))
        .arg("com.sun.image.codec.jpeg.TruncatedFileException")
        .capture(CaptureMode::Capture)
        .allow_failure();
    match ctx.runner.run(probe) {
        Ok(out) if out.success() => true,
        _ => {
            warn!(
                "Batik uses Sun internal class com.sun.image.codec.jpeg.TruncatedFileException which is not present in {}",
                ctx.jdk.home.display()
            );
            false
        }
    }
}

pub fn gate_dacapo(ctx: &GateContext, name: &str, iterations: u32, extra_vm_args: &[String]) -> Result<()> {
    let jar = benchmark_jar(ctx, false)?;
    if name == "batik" && !is_batik_supported(ctx) {
        return Ok(());
    }
    gate_java_benchmark(ctx, &dacapo_args(&jar, name, iterations, extra_vm_args, false), DACAPO_SUCCESS)
}

pub fn gate_scala_dacapo(ctx: &GateContext, name: &str, iterations: u32, extra_vm_args: &[String]) -> Result<()> {
    let jar = benchmark_jar(ctx, true)?;
    gate_java_benchmark(ctx, &dacapo_args(&jar, name, iterations, extra_vm_args, true), SCALA_DACAPO_SUCCESS)
}

fn with_args(base: &[String], more: &[&str]) -> Vec<String> {
    let mut out = base.to_vec();
    out.extend(owned(more));
    out
}

/// Removes the throwaway Graal JDK and its archive.
struct ScratchPaths(Vec<PathBuf>);

impl Drop for ScratchPaths {
    fn drop(&mut self) {
        for path in &self.0 {
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else if path.exists() {
                fs::remove_file(path)
            } else {
                Ok(())
            };
            if let Err(err) = result {
                warn!("failed to remove {}: {}", path.display(), err);
            }
        }
    }
}

const UNIT_TEST_SUITES: &[&str] = &["compiler", "truffle"];

pub fn compiler_tasks<'a>(settings: &'a GateSettings) -> Vec<GateTask<'a, GateContext>> {
    let extra = &settings.extra_vm_args;
    let mut tasks: Vec<GateTask<'a, GateContext>> = Vec::new();

    for suite in UNIT_TEST_SUITES {
        tasks.push(GateTask::new(
            format!("UnitTests: hosted-product {}", suite),
            tags::TEST.iter().copied(),
            move |ctx: &mut GateContext| {
                let mut harness = owned(&["--suite", *suite, "--fail-fast"]);
                if settings.verbose {
                    harness.extend(owned(&["--verbose", "--enable-timing"]));
                }
                let mut vm_args = vec!["-XX:-UseJVMCICompiler".to_string()];
                vm_args.extend(extra.iter().cloned());
                unittest(ctx, &harness, &vm_args)
            },
        ));
    }

    tasks.push(GateTask::new("MakeGraalJDK", tags::TEST.iter().copied(), |ctx: &mut GateContext| {
        if !ctx.jdk.is_jdk8() {
            return Ok(());
        }
        let out = ctx.output_root();
        let dest = out.join("graaljdk");
        let archive = out.join("graaljdk.tar");
        let _scratch = ScratchPaths(vec![dest.clone(), archive.clone()]);
        makegraaljdk(
            ctx,
            &MakeGraalJdkOptions {
                dest,
                force: true,
                archive: Some(archive),
            },
        )
        .map(|_| ())
    }));

    tasks.push(GateTask::new("CTW:hosted", tags::CTW.iter().copied(), move |ctx: &mut GateContext| {
        let args = owned(&[
            "--ctwopts",
            "Inline=false CompilationFailureAction=ExitVM",
            "-esa",
            "-XX:-UseJVMCICompiler",
            "-XX:+EnableJVMCI",
            "-DCompileTheWorld.MultiThreaded=true",
            "-Dgraal.InlineDuringParsing=false",
            "-DCompileTheWorld.Verbose=false",
            "-XX:ReservedCodeCacheSize=300m",
        ]);
        ctw(ctx, &args, extra)
    }));

    for test in bootstrap_tests() {
        let name = test.name;
        let test_tags = test.tags;
        tasks.push(GateTask::new(name, test_tags.iter().copied(), move |ctx: &mut GateContext| {
            let options = if test.suppress.is_empty() {
                JavaOptions::default()
            } else {
                JavaOptions {
                    capture: CaptureMode::Tee,
                    suppress_duplicates: test.suppress.clone(),
                    ..JavaOptions::default()
                }
            };
            run_vm(ctx, &test.command(extra), options).map(|_| ())
        }));
    }

    let jvmci_extra = with_args(extra, &["-XX:+UseJVMCICompiler"]);
    for (name, iterations) in DACAPO_BENCHMARKS {
        let args = jvmci_extra.clone();
        tasks.push(GateTask::new(
            format!("DaCapo:{}", name),
            tags::BENCHMARK_TEST.iter().copied(),
            move |ctx: &mut GateContext| gate_dacapo(ctx, name, *iterations, &args),
        ));
    }
    for (name, iterations) in SCALA_DACAPO_BENCHMARKS {
        let args = jvmci_extra.clone();
        tasks.push(GateTask::new(
            format!("ScalaDaCapo:{}", name),
            tags::BENCHMARK_TEST.iter().copied(),
            move |ctx: &mut GateContext| gate_scala_dacapo(ctx, name, *iterations, &args),
        ));
    }

    let batch = with_args(&jvmci_extra, &["-Xbatch"]);
    tasks.push(GateTask::new("DaCapo_pmd:BatchMode", tags::TEST.iter().copied(), move |ctx: &mut GateContext| {
        gate_dacapo(ctx, "pmd", 1, &batch)
    }));
    let counters = with_args(
        &jvmci_extra,
        &[
            "-Dgraal.LIRProfileMoves=true",
            "-Dgraal.GenericDynamicCounters=true",
            "-XX:JVMCICounterSize=10",
        ],
    );
    tasks.push(GateTask::new(
        "DaCapo_pmd:BenchmarkCounters",
        tags::TEST.iter().copied(),
        move |ctx: &mut GateContext| gate_dacapo(ctx, "pmd", 1, &counters),
    ));

    let xcomp = with_args(extra, &["-XX:+UseJVMCICompiler", "-Xcomp", "-version"]);
    tasks.push(GateTask::new("XCompMode:product", tags::TEST.iter().copied(), move |ctx: &mut GateContext| {
        run_vm(ctx, &xcomp, JavaOptions::default()).map(|_| ())
    }));

    tasks.push(GateTask::new("Javadoc", tags::DOC.iter().copied(), |ctx: &mut GateContext| {
        javadoc(ctx, &[])
    }));

    tasks.push(GateTask::new(
        "JVMCI_CI_VersionSyncCheck",
        tags::STYLE.iter().copied(),
        |ctx: &mut GateContext| verify_jvmci_ci_versions(&ctx.project_root, &ctx.config.ci),
    ));

    tasks
}

type SharedImage = Rc<RefCell<Option<NativeImage>>>;

/// Runs `f` with the gate's native-image session, bootstrapping the launcher
/// and opening the session on first use. The session shuts down once the
/// last task holding it is dropped.
fn with_session<R>(
    shared: &SharedImage,
    ctx: &mut GateContext,
    verbose: bool,
    f: impl FnOnce(&mut GateContext, &NativeImage, &SvmPaths) -> Result<R>,
) -> Result<R> {
    let paths = SvmPaths::from_context(ctx);
    let mut slot = shared.borrow_mut();
    if slot.is_none() {
        bootstrap_native_image(ctx, &paths)?;
        *slot = Some(NativeImage::for_context(ctx, &paths, &owned(&IMAGE_ASSERTION_FLAGS), verbose)?);
    }
    let image = slot
        .as_ref()
        .ok_or_else(|| anyhow!("native-image session is not open"))?;
    f(ctx, image, &paths)
}

const JS_HELLO: &str = r#"print("hello:" + Array.from(new Array(10), (x,i) => i*i ).join("|"))"#;
const JS_HELLO_OUTPUT: &str = "hello:0|1|4|9|16|25|36|49|64|81\n";

pub fn svm_tasks<'a>(settings: &'a GateSettings) -> Vec<GateTask<'a, GateContext>> {
    let shared: SharedImage = Rc::new(RefCell::new(None));
    let verbose = settings.verbose;
    let mut tasks: Vec<GateTask<'a, GateContext>> = Vec::new();

    let s = Rc::clone(&shared);
    tasks.push(GateTask::new("image demos", tags::HELLOWORLD.iter().copied(), move |ctx: &mut GateContext| {
        with_session(&s, ctx, verbose, |ctx, image, paths| {
            helloworld(ctx, image, paths, &[])?;
            cinterfacetutorial(ctx, image, paths, &[])
        })
    }));

    let s = Rc::clone(&shared);
    tasks.push(GateTask::new("JavaScript", tags::JS.iter().copied(), move |ctx: &mut GateContext| {
        with_session(&s, ctx, verbose, |ctx, image, paths| {
            let js = build_js(ctx, image, paths)?;
            let hello = vec![js.display().to_string(), "-e".to_string(), JS_HELLO.to_string()];
            test_run(&ctx.runner, &hello, JS_HELLO_OUTPUT, TEST_RUN_TIMEOUT)?;
            let bench = JsBenchmark::new("octane-richards", 1000, 100, 300);
            js_image_test(&ctx.runner, &js, &js_benchmarks_dir(ctx), &bench, &[])
        })
    }));

    let s = Rc::clone(&shared);
    tasks.push(GateTask::new("Ruby", tags::RUBY.iter().copied(), move |ctx: &mut GateContext| {
        with_session(&s, ctx, verbose, |ctx, image, paths| {
            let ruby = build_ruby(ctx, image, paths)?;
            ruby_smoke(&ctx.runner, &ruby)
        })
    }));

    let s = Rc::clone(&shared);
    tasks.push(GateTask::new("Python", tags::PYTHON.iter().copied(), move |ctx: &mut GateContext| {
        with_session(&s, ctx, verbose, |ctx, image, paths| {
            let python = build_python(ctx, image, paths)?;
            python_smoke(&ctx.runner, &python)
        })
    }));

    tasks.push(GateTask::new("Sulong", tags::SULONG.iter().copied(), move |ctx: &mut GateContext| {
        with_session(&shared, ctx, verbose, |ctx, image, paths| {
            let lli = build_sulong(ctx, image, paths)?;
            sulong_smoke(&ctx.runner, &lli)
        })
    }));

    tasks
}

/// Every task of the gate, compiler tasks first.
pub fn all_tasks<'a>(settings: &'a GateSettings) -> Vec<GateTask<'a, GateContext>> {
    let mut tasks = compiler_tasks(settings);
    tasks.extend(svm_tasks(settings));
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{context, context_with, CONFIG};
    use crate::fsutil::{ensure_dir, test_dir};
    use crate::gate::{run_gate, GateMode, TagFilter, TaskStatus};
    use std::path::Path;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extra_vm_arguments_are_shell_split() {
        let args = parse_extra_vm_args(&v(&["-Da=1 -Db='x y'", "", "-esa"])).expect("split");
        assert_eq!(args, v(&["-Da=1", "-Db=x y", "-esa"]));
        assert!(parse_extra_vm_args(&v(&["-Da='open"])).is_err());
    }

    #[test]
    fn compiler_tags_carry_fulltest_except_docs_and_style() {
        let settings = GateSettings::default();
        let tasks = compiler_tasks(&settings);
        for task in &tasks {
            let full = task.tags.contains("fulltest");
            let doc_or_style = task.tags.contains("javadoc") || task.tags.contains("style");
            assert_eq!(full, !doc_or_style, "{}", task.name);
        }
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names[0], "UnitTests: hosted-product compiler");
        assert!(names.contains(&"CTW:hosted"));
        assert!(names.contains(&"DaCapo:avrora"));
        assert!(names.contains(&"ScalaDaCapo:tmt"));
        assert_eq!(names.last(), Some(&"JVMCI_CI_VersionSyncCheck"));
    }

    #[test]
    fn unmatched_filter_skips_every_task() {
        let settings = GateSettings::default();
        let mut ctx = context(&PathBuf::from("/work"), 11);
        let report = run_gate(
            all_tasks(&settings),
            &TagFilter::parse(Some("nothing-has-this"), None),
            GateMode::FailFast,
            &mut ctx,
        )
        .expect("gate");
        assert!(report.succeeded());
        assert_eq!(report.count(TaskStatus::Skipped), report.tasks.len());
        assert_eq!(report.status_of("Sulong"), Some(TaskStatus::Skipped));
    }

    #[test]
    fn bootstrap_variants() {
        let tests = bootstrap_tests();
        assert_eq!(tests.len(), 9);
        let gc = tests
            .iter()
            .find(|t| t.name == "BootstrapWithGCVerification")
            .expect("gc");
        assert_eq!(gc.suppress, v(&["VerifyAfterGC:", "VerifyBeforeGC:"]));
        let cmd = gc.command(&v(&["-Dx=1"]));
        assert_eq!(cmd[0], "-Dgraal.CompilationWatchDogStartDelay=60.0D");
        let jvmci = cmd.iter().position(|a| a == "-XX:+UseJVMCICompiler").expect("jvmci");
        assert_eq!(cmd[jvmci - 1], "-Dgraal.CompilationFailureAction=ExitVM");
        assert_eq!(cmd[jvmci + 1], "-Dx=1");
        assert_eq!(&cmd[cmd.len() - 3..], &v(&["-XX:-TieredCompilation", "-XX:+BootstrapJVMCI", "-version"])[..]);
        let lite = tests
            .iter()
            .find(|t| t.name == "BootstrapWithSystemAssertions")
            .expect("lite");
        assert_eq!(lite.tags, tags::BOOTSTRAP_LITE);
    }

    #[test]
    fn dacapo_argument_lists() {
        let args = dacapo_args("/b/dacapo.jar", "fop", 8, &v(&["-XX:+UseJVMCICompiler"]), false);
        assert!(args.contains(&"-Djava.net.preferIPv4Stack=true".to_string()));
        assert_eq!(&args[args.len() - 5..], &v(&["-jar", "/b/dacapo.jar", "fop", "-n", "8"])[..]);
        let scala = dacapo_args("/b/scala.jar", "tmt", 1, &[], true);
        assert!(!scala.contains(&"-Djava.net.preferIPv4Stack=true".to_string()));

        let re = Regex::new(&format!("(?m){}", SCALA_DACAPO_SUCCESS)).expect("re");
        assert!(re.is_match("x\n===== DaCapo 0.1.0-SNAPSHOT tmt PASSED in 12 msec =====\n"));
    }

    #[test]
    fn unconfigured_dacapo_jar_is_configuration_error() {
        let ctx = context(&PathBuf::from("/work"), 11);
        let err = gate_dacapo(&ctx, "fop", 1, &[]).expect_err("no jar");
        assert!(err.to_string().contains("benchmarks.dacapo_jar"));
    }

    #[test]
    fn hs_err_path_detection() {
        let out = "#\n# An error report file with more information is saved as:\n# /tmp/run/hs_err_pid4711.log\n";
        assert_eq!(find_hs_err(out), Some(PathBuf::from("/tmp/run/hs_err_pid4711.log")));
        assert_eq!(find_hs_err("all good"), None);
    }

    #[cfg(unix)]
    fn fake_java(root: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let bin = root.join("jdk").join("bin");
        ensure_dir(&bin).expect("bin");
        let java = bin.join("java");
        fs::write(&java, format!("#!/bin/sh\n{}\n", body)).expect("java");
        fs::set_permissions(&java, fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[cfg(unix)]
    #[test]
    fn benchmark_gate_dumps_crash_log_and_checks_success() {
        let root = test_dir("gate_bench");
        let hs_err = root.join("hs_err_pid42.log");
        fs::write(&hs_err, "crash details").expect("hs_err");
        fake_java(
            &root,
            &format!(
                "echo '# {}'\necho '===== DaCapo 9.12 fop PASSED in 100 msec =====' 1>&2",
                hs_err.display()
            ),
        );
        let ctx = context_with(&root, 11, CONFIG, None);
        gate_java_benchmark(&ctx, &v(&["-jar", "dacapo.jar", "fop"]), DACAPO_SUCCESS).expect("passes");
        assert!(!hs_err.exists());

        fake_java(&root, "echo 'no result'");
        let err = gate_java_benchmark(&ctx, &v(&["-jar", "dacapo.jar", "fop"]), DACAPO_SUCCESS).expect_err("fails");
        assert_eq!(
            crate::error::classify(&err).map(GateError::kind),
            Some("process_failure")
        );
        assert!(err.to_string().contains("Could not find benchmark success pattern"));

        fake_java(&root, "echo '===== DaCapo 9.12 fop PASSED in 100 msec ====='\nexit 3");
        let err = gate_java_benchmark(&ctx, &v(&["fop"]), DACAPO_SUCCESS).expect_err("exit code");
        assert_eq!(
            crate::error::classify(&err).map(GateError::kind),
            Some("process_failure")
        );
        let _ = fs::remove_dir_all(root);
    }
}
