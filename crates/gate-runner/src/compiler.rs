//! Commands of the compiler suite: CompileTheWorld, the node cost dump,
//! unit tests, javadoc and the Graal JDK image.

use crate::archive::create_archive;
use crate::context::GateContext;
use crate::fsutil::{absolutize, copy_dir_filtered, ensure_dir};
use crate::participants::VmLaunch;
use crate::process::{CaptureMode, ProcessInvocation};
use crate::svm::host_arch;
use crate::vm::{get_xx_option_value, is_jvmci_enabled, run_java, run_vm, JavaOptions, XxValue};
use crate::GateError;
use anyhow::{Context, Result};
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CTW_MAIN_CLASS: &str = "org.graalvm.compiler.hotspot.test.CompileTheWorld";
pub const CTW_PROJECT: &str = "org.graalvm.compiler.hotspot.test";
const CTW_CONFIG_PREFIX: &str = "-DCompileTheWorld.Config=";
const DEFAULT_CTW_OPTS: &str = "Inline=false";

/// Flags that export the JVMCI API to CompileTheWorld.
pub fn ctw_jvmci_export_args(jdk8: bool) -> Vec<String> {
    if jdk8 {
        return vec!["-XX:-UseJVMCIClassLoader".to_string()];
    }
    ["hotspot", "meta", "services", "runtime"]
        .iter()
        .map(|p| format!("--add-exports=jdk.internal.vm.ci/jdk.vm.ci.{}=ALL-UNNAMED", p))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CtwOptions {
    /// Space separated options for the CTW compilations.
    pub ctwopts: Option<String>,
    /// Jar or class path to compile.
    pub cp: Option<String>,
    pub limitmods: Option<String>,
    /// Everything else is passed to the VM.
    pub vm_args: Vec<String>,
}

fn take_value(args: &[String], i: &mut usize, name: &str) -> Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| GateError::config(format!("{} expects a value", name)))
}

/// `--limitmods` is only understood on JDK 9 and later.
pub fn parse_ctw_args(args: &[String], jdk8: bool) -> Result<CtwOptions> {
    let mut opts = CtwOptions::default();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        let (key, inline) = match arg.split_once('=') {
            Some((k, v)) if k.starts_with("--") => (k, Some(v.to_string())),
            _ => (arg.as_str(), None),
        };
        let slot = match key {
            "--ctwopts" => Some(&mut opts.ctwopts),
            "--cp" | "--jar" => Some(&mut opts.cp),
            "--limitmods" if !jdk8 => Some(&mut opts.limitmods),
            _ => None,
        };
        match slot {
            Some(slot) => {
                let value = match inline {
                    Some(v) => v,
                    None => take_value(args, &mut i, key)?,
                };
                *slot = Some(value);
            }
            None => opts.vm_args.push(arg.clone()),
        }
        i += 1;
    }
    Ok(opts)
}

/// Java arguments for a CompileTheWorld run. `extra_vm_args` go after the
/// command's own VM arguments.
pub fn ctw_command(ctx: &GateContext, args: &[String], extra_vm_args: &[String]) -> Result<Vec<String>> {
    let jdk8 = ctx.jdk.is_jdk8();
    let opts = parse_ctw_args(args, jdk8)?;
    let has_config = opts.vm_args.iter().any(|a| a.starts_with(CTW_CONFIG_PREFIX));

    let mut vm_args = vec!["-Djava.awt.headless=true".to_string()];
    vm_args.extend(opts.vm_args.iter().cloned());
    match &opts.ctwopts {
        Some(_) if has_config => {
            return Err(GateError::config(
                "Cannot specify both --ctwopts and -DCompileTheWorld.Config",
            ));
        }
        Some(ctwopts) => {
            let ws = Regex::new(r"\s+")?;
            vm_args.push(format!("{}{}", CTW_CONFIG_PREFIX, ws.replace_all(ctwopts, "#")));
        }
        None if !has_config => vm_args.push(format!("{}{}", CTW_CONFIG_PREFIX, DEFAULT_CTW_OPTS)),
        None => {}
    }

    let cp = match &opts.cp {
        Some(cp) => {
            if !jdk8 && !is_jvmci_enabled(&vm_args, jdk8) {
                return Err(GateError::config(
                    "Non-Graal CTW does not support specifying a specific class path or jar to compile",
                ));
            }
            Some(absolutize(Path::new(cp))?.display().to_string())
        }
        None => None,
    };

    vm_args.push("-DCompileTheWorld.ExcludeMethodFilter=sun.awt.X11.*.*".to_string());

    let mut effective = vm_args.clone();
    effective.extend(extra_vm_args.iter().cloned());
    if get_xx_option_value(&effective, "UseJVMCICompiler") == Some(XxValue::Flag(true)) {
        vm_args.push("-XX:+BootstrapJVMCI".to_string());
    }

    let jvmci = is_jvmci_enabled(&vm_args, jdk8);
    let mut main = Vec::new();
    if jvmci {
        if !jdk8 {
            let limit: Option<Vec<&str>> = opts.limitmods.as_deref().map(|m| m.split(',').collect());
            let roots: Vec<&str> = ctx
                .jdk
                .modules
                .iter()
                .map(String::as_str)
                .filter(|m| *m != "java.base")
                .filter(|m| limit.as_ref().map_or(true, |l| l.contains(m)))
                .collect();
            if !roots.is_empty() {
                vm_args.push(format!("--add-modules={}", roots.join(",")));
            }
            if let Some(mods) = &opts.limitmods {
                vm_args.push(format!("-DCompileTheWorld.limitmods={}", mods));
            }
        }
        if let Some(cp) = &cp {
            vm_args.push(format!("-DCompileTheWorld.Classpath={}", cp));
        }
        vm_args.extend(ctw_jvmci_export_args(jdk8));
        vm_args.push("-cp".to_string());
        vm_args.push(ctx.classpath(&[CTW_PROJECT.to_string()])?);
        main.push(CTW_MAIN_CLASS.to_string());
    } else {
        vm_args.push("-XX:+CompileTheWorld".to_string());
        if jdk8 {
            if let Some(cp) = &cp {
                vm_args.push(format!("-Xbootclasspath/p:{}", cp));
            }
        }
    }

    vm_args.extend(extra_vm_args.iter().cloned());
    vm_args.extend(main);
    Ok(vm_args)
}

pub fn ctw(ctx: &GateContext, args: &[String], extra_vm_args: &[String]) -> Result<()> {
    let command = ctw_command(ctx, args, extra_vm_args)?;
    run_vm(ctx, &command, JavaOptions::default())?;
    Ok(())
}

/// The system properties CompileTheWorld understands, as printed by the
/// harness itself.
pub fn ctw_help(ctx: &GateContext) -> Result<String> {
    let mut args = vec!["-XX:+EnableJVMCI".to_string()];
    args.extend(ctw_jvmci_export_args(ctx.jdk.is_jdk8()));
    args.extend([
        "-cp".to_string(),
        ctx.classpath(&[CTW_PROJECT.to_string()])?,
        "-DCompileTheWorld.Help=true".to_string(),
        CTW_MAIN_CLASS.to_string(),
    ]);
    let out = run_java(
        ctx,
        &args,
        JavaOptions {
            no_default_args: true,
            ..JavaOptions::captured()
        },
    )?;
    Ok(format!("System properties for CTW:\n\n{}", out.stdout))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCostOptions {
    pub regex: Option<String>,
    pub markdown: bool,
    pub vm_args: Vec<String>,
}

pub fn parse_nodecost_args(args: &[String]) -> Result<NodeCostOptions> {
    let mut opts = NodeCostOptions::default();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--markdown" {
            opts.markdown = true;
        } else if arg == "--regex" {
            opts.regex = Some(take_value(args, &mut i, "--regex")?);
        } else if let Some(v) = arg.strip_prefix("--regex=") {
            opts.regex = Some(v.to_string());
        } else {
            opts.vm_args.push(arg.clone());
        }
        i += 1;
    }
    Ok(opts)
}

pub fn nodecost_command(ctx: &GateContext, opts: &NodeCostOptions, extra_vm_args: &[String]) -> Vec<String> {
    let mut cmd = opts.vm_args.clone();
    cmd.extend(extra_vm_args.iter().cloned());
    cmd.extend([
        format!("-Dprimary.suite.cp={}", ctx.project_root.display()),
        "-XX:-UseJVMCIClassLoader".to_string(),
        "org.graalvm.compiler.hotspot.NodeCostDumpUtil".to_string(),
        opts.regex.clone().unwrap_or_default(),
    ]);
    cmd
}

/// Renders `;`-separated rows as a Markdown table. Every separator cell is
/// as wide as the widest cell.
pub fn render_markdown_table(data: &str) -> String {
    let rows: Vec<Vec<&str>> = data
        .lines()
        .map(|l| if l.is_empty() { Vec::new() } else { l.split(';').collect() })
        .collect();
    let width = rows
        .iter()
        .flat_map(|r| r.iter().map(|c| c.chars().count()))
        .max()
        .unwrap_or(0);
    let line = |row: &[&str]| -> String {
        let mut s = String::from("|");
        for col in row {
            s.push_str(col);
            s.push('|');
        }
        s
    };
    let mut out = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        out.push(line(row));
        if i == 0 {
            let sep = "-".repeat(width);
            let cells: Vec<&str> = row.iter().map(|_| sep.as_str()).collect();
            out.push(line(&cells));
        }
    }
    out.join("\n")
}

/// Lists the cost of every node type. Returns the text to print.
pub fn nodecostdump(ctx: &GateContext, args: &[String], extra_vm_args: &[String]) -> Result<String> {
    let opts = parse_nodecost_args(args)?;
    let command = nodecost_command(ctx, &opts, extra_vm_args);
    let out = run_vm(
        ctx,
        &command,
        JavaOptions {
            capture: CaptureMode::Capture,
            ..JavaOptions::default()
        },
    )?;
    if opts.markdown {
        Ok(render_markdown_table(&out.stdout))
    } else {
        Ok(out.stdout)
    }
}

/// The unit test harness launch after the participant chain ran.
pub fn unittest_launch(ctx: &GateContext, harness_args: &[String], vm_args: &[String]) -> Result<VmLaunch> {
    let mut args = vm_args.to_vec();
    let classpath = &ctx.config.unittest.classpath;
    if !classpath.is_empty() {
        args.push("-cp".to_string());
        args.push(ctx.classpath(classpath)?);
    }
    let launch = VmLaunch::new(args, ctx.config.unittest.main_class.clone(), harness_args.to_vec());
    ctx.apply_participants(launch)
}

pub fn unittest(ctx: &GateContext, harness_args: &[String], vm_args: &[String]) -> Result<()> {
    let launch = unittest_launch(ctx, harness_args, vm_args)?;
    run_vm(ctx, &launch.into_args(), JavaOptions::default())?;
    Ok(())
}

pub fn javadoc(ctx: &GateContext, args: &[String]) -> Result<()> {
    let mut command = vec!["javadoc".to_string()];
    command.extend(args.iter().cloned());
    ctx.run_build_tool(&command)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeGraalJdkOptions {
    pub dest: PathBuf,
    /// Overwrite an existing destination.
    pub force: bool,
    pub archive: Option<PathBuf>,
}

/// `jre/lib/<arch>/server` on Linux, `jre/lib/server` on macOS and Windows.
pub fn jvm_lib_dir(jdk_home: &Path) -> PathBuf {
    let lib = jdk_home.join("jre").join("lib");
    if cfg!(target_os = "macos") || cfg!(windows) {
        lib.join("server")
    } else {
        lib.join(host_arch()).join("server")
    }
}

fn jvm_lib_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "libjvm.dylib"
    } else if cfg!(windows) {
        "jvm.dll"
    } else {
        "libjvm.so"
    }
}

fn suite_of(dist: &str) -> &str {
    dist.split_once(':').map(|(s, _)| s).unwrap_or("compiler")
}

fn source_revision(ctx: &GateContext) -> String {
    let inv = ProcessInvocation::new("git")
        .arg("-C")
        .arg(ctx.project_root.display().to_string())
        .args(["rev-parse", "HEAD"])
        .capture(CaptureMode::Capture)
        .allow_failure();
    match ctx.runner.run(inv) {
        Ok(out) if out.success() => out.stdout.trim().to_string(),
        _ => "unknown".to_string(),
    }
}

/// The `name=` line for `vm.properties`: the `java -version` VM banner with
/// its VM name replaced by `vm_name`.
pub fn vm_properties_name(version_output: &str, vm_name: &str) -> Option<String> {
    let re = Regex::new(r"^(.* )(?:Server|Graal) VM \(build.*").ok()?;
    version_output
        .lines()
        .find_map(|l| re.captures(l))
        .map(|c| format!("name={}{}", &c[1], vm_name))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut fp = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(fp, "{}", line)?;
    Ok(())
}

fn copy_into(src: &Path, dir: &Path, map_files: &mut Vec<PathBuf>) -> Result<()> {
    let name = src
        .file_name()
        .ok_or_else(|| GateError::config(format!("no file name: {}", src.display())))?;
    info!("Copying {} to {}", src.display(), dir.display());
    let candidate = PathBuf::from(format!("{}.map", src.display()));
    if candidate.is_file() && !map_files.contains(&candidate) {
        map_files.push(candidate);
    }
    fs::copy(src, dir.join(name)).with_context(|| format!("failed to copy {}", src.display()))?;
    Ok(())
}

/// Makes a JDK 8 image that uses Graal as its top-tier JIT. Returns the
/// destination directory.
pub fn makegraaljdk(ctx: &GateContext, opts: &MakeGraalJdkOptions) -> Result<PathBuf> {
    if !ctx.jdk.is_jdk8() {
        return Err(GateError::config("Can only make GraalJDK for JDK 8 currently"));
    }
    let dst = absolutize(&opts.dest)?;
    let src = &ctx.jdk.home;
    if dst.exists() {
        if !opts.force {
            return Err(GateError::config(format!(
                "Use --force to overwrite existing directory {}",
                dst.display()
            )));
        }
        fs::remove_dir_all(&dst)?;
    }
    info!("Creating {} from {}", dst.display(), src.display());
    copy_dir_filtered(src, &dst, &[])?;

    let boot_dir = dst.join("jre").join("lib").join("boot");
    ensure_dir(&boot_dir)?;
    let jvmci_dir = dst.join("jre").join("lib").join("jvmci");
    if !jvmci_dir.is_dir() {
        return Err(GateError::config(format!("{} does not exist", jvmci_dir.display())));
    }
    let jvmlib_dir = jvm_lib_dir(&dst);
    let jvmlib = jvmlib_dir.join(jvm_lib_name());
    if !jvmlib.exists() {
        return Err(GateError::config(format!("{} does not exist", jvmlib.display())));
    }

    fs::write(jvmci_dir.join("compiler-name"), "graal\n")?;
    let release = dst.join("release");
    let revision = source_revision(ctx);
    let mut vm_name = "Graal".to_string();
    let mut map_files = Vec::new();
    for name in ctx.jvmci_classpath() {
        copy_into(&ctx.distribution_path(name)?, &jvmci_dir, &mut map_files)?;
        append_line(&release, &format!("{}={}", name, ctx.project_root.display()))?;
        vm_name.push_str(&format!(":{}_{}", suite_of(name), revision));
    }
    for name in ctx.bootclasspath_appends() {
        copy_into(&ctx.entry_path(name)?, &boot_dir, &mut map_files)?;
        append_line(&release, &format!("{}={}", name, ctx.project_root.display()))?;
    }

    let version = ctx.runner.run(
        ProcessInvocation::new(ctx.jdk.java())
            .arg("-version")
            .capture(CaptureMode::Capture),
    )?;
    let banner = format!("{}{}", version.stderr, version.stdout);
    let line = vm_properties_name(&banner, &vm_name).ok_or_else(|| {
        GateError::config(format!(
            "Could not find VM banner in output of `java -version`:\n{}",
            banner
        ))
    })?;
    fs::write(jvmlib_dir.join("vm.properties"), format!("{}\n", line))?;

    let java = dst.join("bin").join(if cfg!(windows) { "java.exe" } else { "java" });
    ctx.runner.run(
        ProcessInvocation::new(java)
            .args(["-XX:+BootstrapJVMCI", "-version"])
            .map_files(map_files),
    )?;

    if let Some(archive) = &opts.archive {
        info!("Archiving {}", archive.display());
        let base = opts
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        create_archive(&dst, archive, &format!("{}/", base))?;
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{context, context_from, CONFIG};
    use crate::fsutil::test_dir;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn ctw_config() -> String {
        format!("{}  {}: out/ctw\n", CONFIG, CTW_PROJECT)
    }

    #[test]
    fn ctw_defaults_to_no_inlining() {
        let root = PathBuf::from("/work");
        let ctx = context_from(&root, 8, &ctw_config());
        let cmd = ctw_command(&ctx, &[], &[]).expect("ctw");
        assert_eq!(cmd[0], "-Djava.awt.headless=true");
        assert!(cmd.contains(&"-DCompileTheWorld.Config=Inline=false".to_string()));
        assert!(cmd.contains(&"-DCompileTheWorld.ExcludeMethodFilter=sun.awt.X11.*.*".to_string()));
        assert!(cmd.contains(&"-XX:-UseJVMCIClassLoader".to_string()));
        assert!(cmd.contains(&"/work/out/ctw".to_string()));
        assert_eq!(cmd.last().map(String::as_str), Some(CTW_MAIN_CLASS));
        assert!(!cmd.contains(&"-XX:+BootstrapJVMCI".to_string()));
    }

    #[test]
    fn ctwopts_whitespace_becomes_hash_and_excludes_config() {
        let root = PathBuf::from("/work");
        let ctx = context_from(&root, 8, &ctw_config());
        let cmd = ctw_command(
            &ctx,
            &v(&["--ctwopts", "Inline=false  CompilationFailureAction=ExitVM", "-esa"]),
            &v(&["-XX:+UseJVMCICompiler"]),
        )
        .expect("ctw");
        assert!(cmd.contains(&"-DCompileTheWorld.Config=Inline=false#CompilationFailureAction=ExitVM".to_string()));
        assert!(cmd.contains(&"-XX:+BootstrapJVMCI".to_string()));
        let main = cmd.iter().position(|a| a == CTW_MAIN_CLASS).expect("main");
        assert_eq!(cmd[main - 1], "-XX:+UseJVMCICompiler");

        let err = ctw_command(
            &ctx,
            &v(&["--ctwopts=Inline=true", "-DCompileTheWorld.Config=Inline=false"]),
            &[],
        )
        .expect_err("both");
        assert!(err.to_string().contains("Cannot specify both"));
    }

    #[test]
    fn ctw_without_jvmci_uses_builtin_mode() {
        let root = PathBuf::from("/work");
        let ctx = context_from(&root, 11, &ctw_config());
        let cmd = ctw_command(&ctx, &[], &[]).expect("ctw");
        assert!(cmd.contains(&"-XX:+CompileTheWorld".to_string()));
        assert!(!cmd.iter().any(|a| a == CTW_MAIN_CLASS));

        let err = ctw_command(&ctx, &v(&["--jar", "app.jar"]), &[]).expect_err("non-graal cp");
        assert!(err.to_string().contains("Non-Graal CTW"));

        let ctx8 = context_from(&root, 8, &ctw_config());
        let cmd = ctw_command(&ctx8, &v(&["-XX:-EnableJVMCI", "--cp", "/lib/app.jar"]), &[]).expect("ctw8");
        assert!(cmd.contains(&"-Xbootclasspath/p:/lib/app.jar".to_string()));
    }

    #[test]
    fn ctw_on_modules_adds_root_modules() {
        let root = PathBuf::from("/work");
        let ctx = context_from(&root, 11, &ctw_config());
        let cmd = ctw_command(
            &ctx,
            &v(&["-XX:+EnableJVMCI", "--limitmods", "jdk.internal.vm.ci", "--cp", "/lib/app.jar"]),
            &[],
        )
        .expect("ctw");
        assert!(cmd.contains(&"--add-modules=jdk.internal.vm.ci".to_string()));
        assert!(cmd.contains(&"-DCompileTheWorld.limitmods=jdk.internal.vm.ci".to_string()));
        assert!(cmd.contains(&"-DCompileTheWorld.Classpath=/lib/app.jar".to_string()));
        assert!(cmd.contains(&"--add-exports=jdk.internal.vm.ci/jdk.vm.ci.meta=ALL-UNNAMED".to_string()));
    }

    #[test]
    fn missing_option_value_is_rejected() {
        let err = parse_ctw_args(&v(&["--cp"]), true).expect_err("value");
        assert!(err.to_string().contains("--cp expects a value"));
        let opts = parse_ctw_args(&v(&["--limitmods", "a"]), true).expect("jdk8");
        assert_eq!(opts.limitmods, None);
        assert_eq!(opts.vm_args, v(&["--limitmods", "a"]));
    }

    #[test]
    fn nodecost_arguments_and_table() {
        let root = PathBuf::from("/work");
        let ctx = context(&root, 11);
        let opts = parse_nodecost_args(&v(&["--regex", "Add.*", "-Xmx1g", "--markdown"])).expect("parse");
        assert!(opts.markdown);
        let cmd = nodecost_command(&ctx, &opts, &v(&["-esa"]));
        assert_eq!(
            cmd,
            v(&[
                "-Xmx1g",
                "-esa",
                "-Dprimary.suite.cp=/work",
                "-XX:-UseJVMCIClassLoader",
                "org.graalvm.compiler.hotspot.NodeCostDumpUtil",
                "Add.*"
            ])
        );

        let table = render_markdown_table("NodeName;Size;Cycles\nAddNode;1;1\n");
        assert_eq!(
            table,
            "|NodeName|Size|Cycles|\n|--------|--------|--------|\n|AddNode|1|1|"
        );
    }

    #[test]
    fn unittest_launch_strips_deployed_jars_and_exports_jvmci() {
        let root = PathBuf::from("/work");
        let yaml = format!("{}unittest:\n  classpath: [GRAAL, org.graalvm.compiler.test]\n", CONFIG);
        let ctx = context_from(&root, 11, &yaml);
        let launch = unittest_launch(&ctx, &v(&["--fail-fast"]), &v(&["-XX:-UseJVMCICompiler"])).expect("launch");
        assert_eq!(launch.main_class, "com.oracle.mxtool.junit.MxJUnitWrapper");
        assert_eq!(launch.main_class_args, v(&["--fail-fast"]));
        let cp = launch.vm_args.iter().position(|a| a == "-cp").expect("cp");
        assert_eq!(launch.vm_args[cp + 1], "/work/out/test");
        assert!(launch
            .vm_args
            .iter()
            .any(|a| a.starts_with("--add-exports=jdk.internal.vm.ci/")));
    }

    #[test]
    fn vm_banner_is_renamed() {
        let out = "java version \"1.8.0_172\"\nJava HotSpot(TM) 64-Bit Server VM (build 25.71-b01-jvmci-0.46, mixed mode)\n";
        assert_eq!(
            vm_properties_name(out, "Graal:compiler_abc"),
            Some("name=Java HotSpot(TM) 64-Bit Graal:compiler_abc".to_string())
        );
        assert_eq!(vm_properties_name("no banner", "Graal"), None);
    }

    #[test]
    fn makegraaljdk_requires_jdk8() {
        let root = PathBuf::from("/work");
        let ctx = context(&root, 11);
        let opts = MakeGraalJdkOptions {
            dest: root.join("graaljdk"),
            force: false,
            archive: None,
        };
        let err = makegraaljdk(&ctx, &opts).expect_err("jdk11");
        assert!(err.to_string().contains("JDK 8"));
    }

    #[cfg(unix)]
    fn stage_jdk(root: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let home = root.join("jdk");
        let bin = home.join("bin");
        ensure_dir(&bin).expect("bin");
        ensure_dir(&home.join("jre/lib/jvmci")).expect("jvmci");
        let lib_dir = jvm_lib_dir(&home);
        ensure_dir(&lib_dir).expect("server");
        fs::write(lib_dir.join(jvm_lib_name()), "").expect("libjvm");
        let java = bin.join("java");
        fs::write(
            &java,
            "#!/bin/sh\necho 'Java HotSpot(TM) 64-Bit Server VM (build 25.71-b01-jvmci-0.46, mixed mode)' 1>&2\n",
        )
        .expect("java");
        fs::set_permissions(&java, fs::Permissions::from_mode(0o755)).expect("chmod");
        let dists = root.join("dists");
        ensure_dir(&dists).expect("dists");
        for f in ["graal.jar", "graal-sdk.jar", "truffle-api.jar"] {
            fs::write(dists.join(f), f).expect("dist");
        }
    }

    #[cfg(unix)]
    #[test]
    fn makegraaljdk_builds_and_archives_an_image() {
        let root = test_dir("makegraaljdk");
        stage_jdk(&root);
        let ctx = context(&root, 8);
        let dest = root.join("graaljdk");
        let archive = root.join("graaljdk.tar");
        let opts = MakeGraalJdkOptions {
            dest: dest.clone(),
            force: false,
            archive: Some(archive.clone()),
        };
        makegraaljdk(&ctx, &opts).expect("make");

        assert_eq!(
            fs::read_to_string(dest.join("jre/lib/jvmci/compiler-name")).expect("name"),
            "graal\n"
        );
        assert!(dest.join("jre/lib/jvmci/graal.jar").is_file());
        assert!(dest.join("jre/lib/boot/graal-sdk.jar").is_file());
        assert!(dest.join("jre/lib/boot/truffle-api.jar").is_file());
        let release = fs::read_to_string(dest.join("release")).expect("release");
        let keys: Vec<&str> = release.lines().filter_map(|l| l.split('=').next()).collect();
        assert_eq!(keys, vec!["GRAAL", "GRAAL_SDK", "TRUFFLE_API"]);
        let props = fs::read_to_string(jvm_lib_dir(&dest).join("vm.properties")).expect("props");
        assert!(props.starts_with("name=Java HotSpot(TM) 64-Bit Graal:compiler_"));

        let entries = crate::archive::list_entries(&archive).expect("entries");
        assert!(entries.contains(&"graaljdk/release".to_string()));
        assert!(entries.iter().all(|e| e.starts_with("graaljdk/")));

        let err = makegraaljdk(&ctx, &MakeGraalJdkOptions { archive: None, ..opts.clone() }).expect_err("exists");
        assert!(err.to_string().contains("Use --force"));
        makegraaljdk(&ctx, &MakeGraalJdkOptions { force: true, archive: None, ..opts }).expect("force");
        let _ = fs::remove_dir_all(root);
    }
}
