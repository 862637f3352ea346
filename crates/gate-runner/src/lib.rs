//! Build and test orchestration for the JIT compiler and native-image suites.
//!
//! The crate drives external programs (the JDK, the build tool, produced
//! native images) and owns only the glue between them: tagged gate tasks,
//! VM argument rewriting, process execution with output de-obfuscation,
//! artifact layouts and archives, and suite imports.

pub mod archive;
pub mod args;
pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod fsutil;
pub mod gate;
pub mod gate_tasks;
pub mod languages;
pub mod layout;
pub mod participants;
pub mod process;
pub mod suites;
pub mod svm;
pub mod unstrip;
pub mod vm;

pub use config::GateConfig;
pub use context::GateContext;
pub use error::GateError;
pub use gate::{run_gate, GateMode, GateReport, GateTask, TagFilter, TaskStatus};
pub use process::{ExitOutcome, ExitStatusKind, ProcessInvocation, ProcessRunner};
