use anyhow::Result;
use clap::{Parser, Subcommand};
use gate_runner::compiler::{self, MakeGraalJdkOptions};
use gate_runner::config::find_project_root;
use gate_runner::context::ContextOptions;
use gate_runner::error::classify;
use gate_runner::fsutil::atomic_write_json_pretty;
use gate_runner::gate_tasks::{all_tasks, parse_extra_vm_args, GateSettings};
use gate_runner::languages::fetch_languages;
use gate_runner::svm::{self, NativeImage, SvmPaths, IMAGE_ASSERTION_FLAGS};
use gate_runner::vm::{check_jvmci_version, run_vm, verify_jvmci_ci_versions, JavaOptions};
use gate_runner::{run_gate, GateContext, GateMode, GateReport, TagFilter};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "gate",
    version,
    about = "Build, test and gate the JIT compiler and native-image suites"
)]
struct Cli {
    /// Directory holding gate.yaml (default: nearest ancestor that has one).
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,
    /// Command prefix for VM launches, e.g. "gdb --args".
    #[arg(long, global = true)]
    vmprefix: Option<String>,
    /// De-obfuscate output of VMs running stripped jars.
    #[arg(long, global = true)]
    strip_jars: bool,
    /// Shell-escaped VM arguments appended to compiler commands. Repeatable.
    #[arg(long = "extra-vm-argument", global = true, allow_hyphen_values = true)]
    extra_vm_argument: Vec<String>,
    #[arg(long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tagged gate tasks.
    Gate {
        /// Comma separated tags; only tasks carrying one of them run.
        #[arg(long)]
        tags: Option<String>,
        /// Comma separated tags; tasks carrying one of them are skipped.
        #[arg(long)]
        exclude_tags: Option<String>,
        #[arg(long)]
        continue_on_failure: bool,
        /// Write the JSON gate report here.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Build with the build tool, then bootstrap native-image.
    #[command(disable_help_flag = true)]
    Build {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the JVMCI VM: [-options] class [args...]
    Vm {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run CompileTheWorld.
    #[command(disable_help_flag = true)]
    Ctw {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List the costs associated with each node type: [--regex R] [--markdown]
    Nodecostdump {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Javadoc {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the unit test harness.
    Unittest {
        /// VM argument for the harness VM. Repeatable.
        #[arg(long = "vm-arg", allow_hyphen_values = true)]
        vm_args: Vec<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Make a JDK with Graal as the default top level JIT.
    Makegraaljdk {
        #[arg(short, long)]
        force: bool,
        #[arg(short, long)]
        archive: Option<PathBuf>,
        dest: PathBuf,
    },
    Helloworld {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Cinterfacetutorial {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Fetch language suites: [--language:name[=version=V]]...
    FetchLanguages {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run benchmarks through the build tool.
    Benchmark {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Check that CI configurations agree on the JVMCI version.
    VerifyJvmciCiVersions,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = classify(&err).map(|e| e.kind()).unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();
}

impl Commands {
    /// Commands that only read configuration or delegate to the build tool.
    fn needs_jdk(&self) -> bool {
        !matches!(
            self,
            Commands::Javadoc { .. }
                | Commands::FetchLanguages { .. }
                | Commands::Benchmark { .. }
                | Commands::VerifyJvmciCiVersions
        )
    }
}

fn load_context(cli: &Cli) -> Result<GateContext> {
    let root = match &cli.project_root {
        Some(root) => root.clone(),
        None => {
            let cwd = std::env::current_dir()?;
            find_project_root(&cwd).unwrap_or(cwd)
        }
    };
    let options = ContextOptions {
        strip_jars: cli.strip_jars,
        vm_prefix: cli.vmprefix.clone(),
        extra_vm_args: parse_extra_vm_args(&cli.extra_vm_argument)?,
        skip_jdk_detection: !cli.command.needs_jdk(),
        suite_source: None,
    };
    tracing::debug!(project_root = %root.display(), "loading gate context");
    GateContext::load(&root, options)
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let mut ctx = load_context(&cli)?;
    let json = cli.json;
    let verbose = cli.verbose;
    let extra = ctx.extra_vm_args().to_vec();
    let paths = SvmPaths::from_context(&ctx);

    match cli.command {
        Commands::Gate {
            tags,
            exclude_tags,
            continue_on_failure,
            report,
        } => {
            check_jvmci_version(&ctx)?;
            let settings = GateSettings {
                extra_vm_args: extra,
                verbose,
            };
            let filter = TagFilter::parse(tags.as_deref(), exclude_tags.as_deref());
            let mode = if continue_on_failure {
                GateMode::ContinueOnFailure
            } else {
                GateMode::FailFast
            };
            let result = run_gate(all_tasks(&settings), &filter, mode, &mut ctx)?;
            if let Some(path) = &report {
                atomic_write_json_pretty(path, &result.to_json())?;
            }
            if json {
                emit_json(&result.to_json());
                if !result.succeeded() {
                    std::process::exit(1);
                }
                return Ok(None);
            }
            print_report(&result);
            result.into_result()?;
        }
        Commands::Build { args } => {
            svm::register_participants(&mut ctx);
            svm::build(&ctx, &paths, &args)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "build",
                    "native_image": paths.native_image_path(),
                })));
            }
        }
        Commands::Vm { args } => {
            check_jvmci_version(&ctx)?;
            run_vm(&ctx, &args, JavaOptions::default())?;
        }
        Commands::Ctw { args } => {
            if args.iter().any(|a| a == "-h" || a == "--help") {
                println!("{}", compiler::ctw_help(&ctx)?);
                return Ok(None);
            }
            check_jvmci_version(&ctx)?;
            compiler::ctw(&ctx, &args, &extra)?;
        }
        Commands::Nodecostdump { args } => {
            let out = compiler::nodecostdump(&ctx, &args, &extra)?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "nodecostdump", "output": out })));
            }
            println!("{}", out);
        }
        Commands::Javadoc { args } => compiler::javadoc(&ctx, &args)?,
        Commands::Unittest { vm_args, args } => {
            check_jvmci_version(&ctx)?;
            let mut all_vm_args = vm_args;
            all_vm_args.extend(extra);
            compiler::unittest(&ctx, &args, &all_vm_args)?;
        }
        Commands::Makegraaljdk {
            force,
            archive,
            dest,
        } => {
            let dst = compiler::makegraaljdk(
                &ctx,
                &MakeGraalJdkOptions {
                    dest,
                    force,
                    archive: archive.clone(),
                },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "makegraaljdk",
                    "dest": dst,
                    "archive": archive,
                })));
            }
            println!("graal_jdk: {}", dst.display());
        }
        Commands::Helloworld { args } => {
            svm::register_participants(&mut ctx);
            svm::bootstrap_native_image(&ctx, &paths)?;
            let image = open_session(&ctx, &paths, verbose)?;
            svm::helloworld(&ctx, &image, &paths, &args)?;
        }
        Commands::Cinterfacetutorial { args } => {
            svm::register_participants(&mut ctx);
            svm::bootstrap_native_image(&ctx, &paths)?;
            let image = open_session(&ctx, &paths, verbose)?;
            svm::cinterfacetutorial(&ctx, &image, &paths, &args)?;
        }
        Commands::FetchLanguages { args } => {
            let fetched = fetch_languages(&mut ctx, &paths.native_image_root, &args, false)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "fetch-languages",
                    "languages": fetched,
                })));
            }
            for flag in fetched {
                println!("language: {}", flag);
            }
        }
        Commands::Benchmark { args } => {
            svm::register_participants(&mut ctx);
            svm::benchmark(&mut ctx, &paths, &args)?;
        }
        Commands::VerifyJvmciCiVersions => {
            verify_jvmci_ci_versions(&ctx.project_root, &ctx.config.ci)?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "verify-jvmci-ci-versions" })));
            }
        }
    }
    Ok(None)
}

fn open_session(ctx: &GateContext, paths: &SvmPaths, verbose: bool) -> Result<NativeImage> {
    let flags: Vec<String> = IMAGE_ASSERTION_FLAGS.iter().map(|s| s.to_string()).collect();
    NativeImage::for_context(ctx, paths, &flags, verbose)
}

fn print_report(report: &GateReport) {
    for task in &report.tasks {
        let duration = task
            .duration_ms
            .map(|ms| format!(" ({} ms)", ms))
            .unwrap_or_default();
        println!("{:<8} {}{}", task.status.as_str(), task.name, duration);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
