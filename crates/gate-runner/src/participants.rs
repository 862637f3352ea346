//! Config participant chain.
//!
//! Participants rewrite a [`VmLaunch`] before the VM is started. They run in
//! registration order and each one sees the output of the previous one.

use crate::args::{classpath_value, join_path_list, map_classpath, split_path_list, uniqify};
use crate::GateError;
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmLaunch {
    pub vm_args: Vec<String>,
    pub main_class: String,
    pub main_class_args: Vec<String>,
}

impl VmLaunch {
    pub fn new(vm_args: Vec<String>, main_class: impl Into<String>, main_class_args: Vec<String>) -> Self {
        Self {
            vm_args,
            main_class: main_class.into(),
            main_class_args,
        }
    }

    /// Flattened argument vector: `vm_args main_class main_class_args`.
    pub fn into_args(self) -> Vec<String> {
        let mut out = self.vm_args;
        out.push(self.main_class);
        out.extend(self.main_class_args);
        out
    }
}

pub trait ConfigParticipant {
    fn name(&self) -> &str;

    fn apply(&self, launch: VmLaunch) -> Result<VmLaunch>;
}

/// Adapts a closure into a participant.
pub struct FnParticipant<F> {
    name: String,
    f: F,
}

impl<F> FnParticipant<F>
where
    F: Fn(VmLaunch) -> Result<VmLaunch>,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ConfigParticipant for FnParticipant<F>
where
    F: Fn(VmLaunch) -> Result<VmLaunch>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, launch: VmLaunch) -> Result<VmLaunch> {
        (self.f)(launch)
    }
}

/// Append-only, ordered participant registry.
#[derive(Default)]
pub struct ParticipantChain {
    participants: Vec<Box<dyn ConfigParticipant>>,
}

impl fmt::Debug for ParticipantChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ParticipantChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, participant: Box<dyn ConfigParticipant>) {
        debug!(participant = participant.name(), "registered config participant");
        self.participants.push(participant);
    }

    pub fn names(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn apply(&self, initial: VmLaunch) -> Result<VmLaunch> {
        if initial.main_class.is_empty() {
            return Err(GateError::config("VM launch has no main class"));
        }
        let mut launch = initial;
        for participant in &self.participants {
            launch = participant
                .apply(launch)
                .with_context(|| format!("config participant '{}' failed", participant.name()))?;
            if launch.main_class.is_empty() {
                return Err(GateError::config(format!(
                    "config participant '{}' removed the main class",
                    participant.name()
                )));
            }
        }
        Ok(launch)
    }
}

/// Classpath entries a [`ClasspathStripper`] removes. Clones share state,
/// so the owner can update the set after the stripper is registered.
#[derive(Debug, Clone, Default)]
pub struct RedundantEntries {
    state: Rc<RefCell<RedundantState>>,
}

#[derive(Debug)]
enum RedundantState {
    Known(BTreeSet<String>),
    /// Why the set could not be computed. Raised on the next launch.
    Unresolved(String),
}

impl Default for RedundantState {
    fn default() -> Self {
        RedundantState::Known(BTreeSet::new())
    }
}

impl RedundantEntries {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shared = Self::default();
        shared.set(entries);
        shared
    }

    pub fn set<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.state.borrow_mut() = RedundantState::Known(entries.into_iter().map(Into::into).collect());
    }

    pub fn set_unresolved(&self, reason: impl Into<String>) {
        *self.state.borrow_mut() = RedundantState::Unresolved(reason.into());
    }

    pub fn snapshot(&self) -> Result<BTreeSet<String>> {
        match &*self.state.borrow() {
            RedundantState::Known(entries) => Ok(entries.clone()),
            RedundantState::Unresolved(reason) => Err(GateError::config(format!(
                "cannot strip the classpath: {}",
                reason
            ))),
        }
    }
}

/// Drops classpath entries that are already deployed through the JVMCI class
/// path or the boot class path, and dedups the rest.
#[derive(Debug, Clone, Default)]
pub struct ClasspathStripper {
    redundant: RedundantEntries,
}

impl ClasspathStripper {
    pub fn new<I, S>(redundant: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::shared(RedundantEntries::new(redundant))
    }

    /// A stripper that reads `redundant` on every launch.
    pub fn shared(redundant: RedundantEntries) -> Self {
        Self { redundant }
    }
}

impl ConfigParticipant for ClasspathStripper {
    fn name(&self) -> &str {
        "classpath-stripper"
    }

    fn apply(&self, launch: VmLaunch) -> Result<VmLaunch> {
        let redundant = self.redundant.snapshot()?;
        let vm_args = map_classpath(&launch.vm_args, |cp| {
            let kept: Vec<String> = uniqify(&split_path_list(cp))
                .into_iter()
                .filter(|e| !redundant.contains(e))
                .collect();
            join_path_list(&kept)
        });
        Ok(VmLaunch { vm_args, ..launch })
    }
}

/// Opens JVMCI packages to the compiler module and unnamed modules.
#[derive(Debug, Clone)]
pub struct JvmciExports {
    packages: Vec<String>,
    jdk_major: u32,
}

impl JvmciExports {
    pub fn new(packages: Vec<String>, jdk_major: u32) -> Self {
        Self {
            packages,
            jdk_major,
        }
    }

    pub fn default_packages() -> Vec<String> {
        [
            "jdk.vm.ci.code",
            "jdk.vm.ci.code.site",
            "jdk.vm.ci.common",
            "jdk.vm.ci.hotspot",
            "jdk.vm.ci.meta",
            "jdk.vm.ci.runtime",
            "jdk.vm.ci.services",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl ConfigParticipant for JvmciExports {
    fn name(&self) -> &str {
        "jvmci-exports"
    }

    fn apply(&self, launch: VmLaunch) -> Result<VmLaunch> {
        let mut vm_args = launch.vm_args.clone();
        if self.jdk_major < 9 {
            if !vm_args.iter().any(|a| a == "-XX:-UseJVMCIClassLoader") {
                vm_args.push("-XX:-UseJVMCIClassLoader".to_string());
            }
        } else if classpath_value(&launch.vm_args).is_some() {
            for package in &self.packages {
                let export = format!(
                    "--add-exports=jdk.internal.vm.ci/{}=jdk.internal.vm.compiler,ALL-UNNAMED",
                    package
                );
                if !vm_args.contains(&export) {
                    vm_args.push(export);
                }
            }
        }
        Ok(VmLaunch { vm_args, ..launch })
    }
}

/// Host compiler flags for the native-image builder VM.
#[derive(Debug, Clone)]
pub struct CompilerFlags {
    cpu_count: usize,
}

impl CompilerFlags {
    pub fn new() -> Self {
        Self {
            cpu_count: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1),
        }
    }

    pub fn with_cpu_count(cpu_count: usize) -> Self {
        Self { cpu_count }
    }

    pub fn compiler_threads(&self) -> usize {
        if self.cpu_count <= 4 {
            2
        } else {
            4
        }
    }

    pub fn flags(&self) -> Vec<String> {
        vec![
            "-XX:-UseJVMCIClassLoader".to_string(),
            "-XX:+UseJVMCICompiler".to_string(),
            "-Dgraal.CompileGraalWithC1Only=false".to_string(),
            format!("-XX:CICompilerCount={}", self.compiler_threads()),
            "-Dtruffle.TrustAllTruffleRuntimeProviders=true".to_string(),
            "-Dgraal.VerifyGraalGraphs=false".to_string(),
            "-Dgraal.VerifyGraalGraphEdges=false".to_string(),
            "-Dgraal.VerifyGraalPhasesSize=false".to_string(),
            "-Dgraal.VerifyPhases=false".to_string(),
        ]
    }
}

impl Default for CompilerFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigParticipant for CompilerFlags {
    fn name(&self) -> &str {
        "compiler-flags"
    }

    fn apply(&self, launch: VmLaunch) -> Result<VmLaunch> {
        let mut vm_args: Vec<String> = self
            .flags()
            .into_iter()
            .filter(|f| !launch.vm_args.contains(f))
            .collect();
        vm_args.extend(launch.vm_args.iter().cloned());
        Ok(VmLaunch { vm_args, ..launch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn launch(cp: &str) -> VmLaunch {
        VmLaunch::new(
            vec!["-cp".to_string(), cp.to_string()],
            "com.example.Main",
            vec!["arg".to_string()],
        )
    }

    #[test]
    fn fixed_order_gives_fixed_output() {
        let mut chain = ParticipantChain::new();
        chain.register(Box::new(ClasspathStripper::new(["graal.jar"])));
        chain.register(Box::new(JvmciExports::new(vec!["jdk.vm.ci.meta".to_string()], 11)));
        let out = chain
            .apply(launch("app.jar:graal.jar:app.jar:lib.jar"))
            .expect("apply");
        assert_eq!(
            out.vm_args,
            vec![
                "-cp".to_string(),
                "app.jar:lib.jar".to_string(),
                "--add-exports=jdk.internal.vm.ci/jdk.vm.ci.meta=jdk.internal.vm.compiler,ALL-UNNAMED"
                    .to_string(),
            ]
        );
        assert_eq!(out.main_class, "com.example.Main");
        assert_eq!(out.main_class_args, vec!["arg"]);
        assert_eq!(chain.names(), vec!["classpath-stripper", "jvmci-exports"]);
    }

    #[test]
    fn order_is_significant_when_participants_share_the_classpath() {
        let add_graal = || {
            FnParticipant::new("add-graal", |l: VmLaunch| {
                let vm_args = map_classpath(&l.vm_args, |cp| format!("{}:graal.jar", cp));
                Ok(VmLaunch { vm_args, ..l })
            })
        };

        let mut strip_first = ParticipantChain::new();
        strip_first.register(Box::new(ClasspathStripper::new(["graal.jar"])));
        strip_first.register(Box::new(add_graal()));

        let mut add_first = ParticipantChain::new();
        add_first.register(Box::new(add_graal()));
        add_first.register(Box::new(ClasspathStripper::new(["graal.jar"])));

        let a = strip_first.apply(launch("app.jar")).expect("a");
        let b = add_first.apply(launch("app.jar")).expect("b");
        assert_eq!(a.vm_args[1], "app.jar:graal.jar");
        assert_eq!(b.vm_args[1], "app.jar");
    }

    #[test]
    fn participants_are_safe_to_apply_twice() {
        let mut chain = ParticipantChain::new();
        chain.register(Box::new(ClasspathStripper::new(["graal.jar"])));
        chain.register(Box::new(JvmciExports::new(JvmciExports::default_packages(), 8)));
        let once = chain.apply(launch("a.jar:graal.jar")).expect("once");
        let twice = chain.apply(once.clone()).expect("twice");
        assert_eq!(once, twice);
        assert_eq!(
            twice.vm_args.iter().filter(|a| *a == "-XX:-UseJVMCIClassLoader").count(),
            1
        );
    }

    #[test]
    fn failing_participant_aborts_apply() {
        let mut chain = ParticipantChain::new();
        chain.register(Box::new(FnParticipant::new("broken", |_: VmLaunch| Err(anyhow!("lookup failed")))));
        let err = chain.apply(launch("a.jar")).expect_err("must fail");
        assert!(format!("{:#}", err).contains("config participant 'broken' failed"));
    }

    #[test]
    fn main_class_must_survive_the_chain() {
        let mut chain = ParticipantChain::new();
        chain.register(Box::new(FnParticipant::new("eraser", |l: VmLaunch| {
            Ok(VmLaunch {
                main_class: String::new(),
                ..l
            })
        })));
        let err = chain.apply(launch("a.jar")).expect_err("must fail");
        assert!(err.to_string().contains("eraser"));
    }

    #[test]
    fn compiler_thread_count_follows_core_count() {
        assert_eq!(CompilerFlags::with_cpu_count(2).compiler_threads(), 2);
        assert_eq!(CompilerFlags::with_cpu_count(4).compiler_threads(), 2);
        assert_eq!(CompilerFlags::with_cpu_count(16).compiler_threads(), 4);
        let out = CompilerFlags::with_cpu_count(8)
            .apply(launch("a.jar"))
            .expect("flags");
        assert!(out.vm_args.contains(&"-XX:CICompilerCount=4".to_string()));
        assert_eq!(out.vm_args.last().map(String::as_str), Some("a.jar"));
    }
}
