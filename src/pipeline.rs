//! Transform contract and the driver that runs transforms to a fixed point.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::program::{ClassUnit, Code, FieldUnit, MethodUnit, Program};
use crate::remap::NamePolicy;

/// A stage that keeps reporting changes after this many passes is considered broken.
const MAX_PASSES: usize = 1000;

/// Settings shared by every stage of a run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Name table seeding the remapper
    pub name_table: Option<PathBuf>,
    /// Package given to classes left in the default package after renaming
    pub default_package: String,
    /// Holder class receiving relocated static fields
    pub statics_class: String,
    /// Directory receiving per-method block graphs
    pub graphs_dir: Option<PathBuf>,
    pub name_policy: NamePolicy,
    /// Run every stage but leave the filesystem alone
    pub dry: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            name_table: None,
            default_package: "deob".to_string(),
            statics_class: "Statics".to_string(),
            graphs_dir: None,
            name_policy: NamePolicy::default(),
            dry: false,
        }
    }
}

/// Named counters a stage accumulates while it runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    counters: BTreeMap<&'static str, usize>,
}

impl Stats {
    pub fn add(&mut self, counter: &'static str, amount: usize) {
        *self.counters.entry(counter).or_insert(0) += amount;
    }

    pub fn incr(&mut self, counter: &'static str) {
        self.add(counter, 1);
    }

    pub fn get(&self, counter: &str) -> usize {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: Stats) {
        for (counter, amount) in other.counters {
            self.add(counter, amount);
        }
    }
}

/// Everything a hook may touch besides the program: the stage's private state,
/// its counters and the run settings. A fresh context is created for every run
/// of a stage, so nothing carries over between stages.
pub struct StageContext<'a, S> {
    pub state: S,
    pub stats: Stats,
    pub settings: &'a Settings,
}

pub type ProgramHook<S> = fn(&mut Program, &mut StageContext<'_, S>) -> Result<bool>;
pub type ClassHook<S> = fn(&mut ClassUnit, &mut StageContext<'_, S>) -> Result<bool>;
pub type FieldHook<S> = fn(&mut FieldUnit, &mut StageContext<'_, S>) -> Result<bool>;
pub type MethodHook<S> = fn(&mut MethodUnit, &mut StageContext<'_, S>) -> Result<bool>;
/// Called for methods that have code. The method's `code` is detached while the hook runs.
pub type CodeHook<S> = fn(&MethodUnit, &mut Code, &mut StageContext<'_, S>) -> Result<bool>;

/// A transform is a bundle of optional hooks. Every hook reports whether it
/// changed the program; the per-pass hooks are repeated until a whole pass
/// reports no change.
pub struct Transform<S = ()> {
    pub name: &'static str,
    /// Once, before the first pass
    pub before_all: Option<ProgramHook<S>>,
    pub class: Option<ClassHook<S>>,
    pub field: Option<FieldHook<S>>,
    /// Before the method's code hook
    pub method_pre: Option<MethodHook<S>>,
    pub code: Option<CodeHook<S>>,
    /// After the method's code hook
    pub method_post: Option<MethodHook<S>>,
    /// Once per pass, after every class has been visited
    pub pass: Option<ProgramHook<S>>,
    /// Once, after the fixed point is reached
    pub after_all: Option<ProgramHook<S>>,
}

impl<S> Transform<S> {
    pub const fn new(name: &'static str) -> Transform<S> {
        Transform {
            name,
            before_all: None,
            class: None,
            field: None,
            method_pre: None,
            code: None,
            method_post: None,
            pass: None,
            after_all: None,
        }
    }
}

/// What a stage did: how many passes it took and its counters.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: String,
    pub passes: usize,
    pub counters: Stats,
}

impl StageReport {
    pub fn counters(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.counters.counters.iter().map(|(name, value)| (*name, *value))
    }
}

/// A transform with its state type erased, so stages of different types can
/// share one pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, program: &mut Program, settings: &Settings) -> Result<StageReport>;
}

impl<S: Default> Stage for Transform<S> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, program: &mut Program, settings: &Settings) -> Result<StageReport> {
        run(self, program, settings)
    }
}

fn visit_class<S>(transform: &Transform<S>, class: &mut ClassUnit, ctx: &mut StageContext<'_, S>) -> Result<bool> {
    let mut changed = false;
    if let Some(hook) = transform.class {
        changed |= hook(class, ctx)?;
    }
    if let Some(hook) = transform.field {
        for field in &mut class.fields {
            changed |= hook(field, ctx)?;
        }
    }
    for method in &mut class.methods {
        if let Some(hook) = transform.method_pre {
            changed |= hook(method, ctx)?;
        }
        if let Some(hook) = transform.code {
            if let Some(mut code) = method.code.take() {
                let result = hook(method, &mut code, ctx);
                method.code = Some(code);
                changed |= result?;
            }
        }
        if let Some(hook) = transform.method_post {
            changed |= hook(method, ctx)?;
        }
    }
    Ok(changed)
}

/// Runs one transform over the whole program until it stops reporting changes.
pub fn run<S: Default>(transform: &Transform<S>, program: &mut Program, settings: &Settings) -> Result<StageReport> {
    let mut ctx = StageContext {
        state: S::default(),
        stats: Stats::default(),
        settings,
    };

    if let Some(hook) = transform.before_all {
        hook(program, &mut ctx)?;
    }

    let mut passes = 0;
    loop {
        if passes == MAX_PASSES {
            return Err(Error::Invariant(format!(
                "stage {} did not settle after {} passes",
                transform.name, MAX_PASSES
            )));
        }
        passes += 1;

        let mut changed = false;
        for class in &mut program.classes {
            changed |= visit_class(transform, class, &mut ctx)?;
        }
        if let Some(hook) = transform.pass {
            changed |= hook(program, &mut ctx)?;
        }
        debug!("{}: pass {} changed={}", transform.name, passes, changed);
        if !changed {
            break;
        }
    }

    if let Some(hook) = transform.after_all {
        hook(program, &mut ctx)?;
    }

    Ok(StageReport {
        stage: transform.name.to_string(),
        passes,
        counters: ctx.stats,
    })
}

/// Ordered list of stages, each run to its own fixed point before the next starts.
pub struct Pipeline {
    stages: Vec<&'static dyn Stage>,
}

impl Pipeline {
    /// Resolves stage names through `lookup`. Unknown names are reported and
    /// skipped; an empty result is an error.
    pub fn from_names<N: AsRef<str>>(
        names: &[N],
        lookup: impl Fn(&str) -> Option<&'static dyn Stage>,
    ) -> Result<Pipeline> {
        let mut stages = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            match lookup(name) {
                Some(stage) => stages.push(stage),
                None => warn!("{}, skipping", Error::UnknownStage(name.to_string())),
            }
        }
        if stages.is_empty() {
            return Err(Error::NoStages);
        }
        Ok(Pipeline { stages })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn run(&self, program: &mut Program, settings: &Settings) -> Result<Vec<StageReport>> {
        let mut reports = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            info!("Running stage {}", stage.name());
            let report = stage.run(program, settings)?;
            let counters: Vec<String> = report
                .counters()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            info!(
                "Finished {} after {} passes {}",
                report.stage,
                report.passes,
                counters.join(" ")
            );
            reports.push(report);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::Insn;
    use crate::opcodes::*;
    use crate::program::AccessFlags;

    const SETTLES_AFTER: usize = 3;

    fn settle_after_three(_: &mut ClassUnit, ctx: &mut StageContext<'_, usize>) -> Result<bool> {
        ctx.state += 1;
        ctx.stats.incr("invocations");
        Ok(ctx.state <= SETTLES_AFTER)
    }

    static SETTLING: Transform<usize> = Transform {
        class: Some(settle_after_three),
        ..Transform::new("settling")
    };

    fn count_once(_: &mut Program, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
        ctx.stats.incr("before");
        Ok(true)
    }

    fn strip_nops(_: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
        let removed = code
            .instructions
            .remove_if(|_, insn| insn == &Insn::Simple(NOP));
        ctx.stats.add("nops", removed);
        Ok(removed > 0)
    }

    static STRIP_NOPS: Transform = Transform {
        before_all: Some(count_once),
        code: Some(strip_nops),
        ..Transform::new("strip-nops")
    };

    fn fail(_: &mut Program, _: &mut StageContext<'_, ()>) -> Result<bool> {
        Err(Error::Invariant("boom".to_string()))
    }

    static FAILING: Transform = Transform {
        pass: Some(fail),
        ..Transform::new("failing")
    };

    fn lookup(name: &str) -> Option<&'static dyn Stage> {
        match name {
            "settling" => Some(&SETTLING),
            "strip-nops" => Some(&STRIP_NOPS),
            "failing" => Some(&FAILING),
            _ => None,
        }
    }

    fn program() -> Program {
        let mut class = ClassUnit::new("a", Some("java/lang/Object"), AccessFlags::PUBLIC);
        let mut method = MethodUnit::new("a", "b", "()V", AccessFlags::STATIC);
        let mut code = Code::default();
        code.instructions.push(Insn::Simple(NOP));
        code.instructions.push(Insn::Simple(NOP));
        code.instructions.push(Insn::Simple(RETURN));
        method.code = Some(code);
        class.methods.push(method);
        Program::new(vec![class])
    }

    #[test]
    fn runs_until_no_change() {
        let mut program = program();
        let report = run(&SETTLING, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.passes, SETTLES_AFTER + 1);
        assert_eq!(report.counters.get("invocations"), SETTLES_AFTER + 1);
    }

    #[test]
    fn state_is_fresh_for_every_run() {
        let mut program = program();
        let settings = Settings::default();
        run(&SETTLING, &mut program, &settings).unwrap();
        let report = run(&SETTLING, &mut program, &settings).unwrap();
        assert_eq!(report.passes, SETTLES_AFTER + 1);
    }

    #[test]
    fn code_hooks_see_method_bodies() {
        let mut program = program();
        let report = run(&STRIP_NOPS, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.counters.get("nops"), 2);
        assert_eq!(report.counters.get("before"), 1);
        let code = program.classes[0].methods[0].code.as_ref().unwrap();
        assert_eq!(code.instructions.len(), 1);
    }

    #[test]
    fn unknown_stages_are_skipped() {
        let pipeline = Pipeline::from_names(&["strip-nops", "nope", "settling"], lookup).unwrap();
        assert_eq!(pipeline.names(), vec!["strip-nops", "settling"]);
        let reports = pipeline.run(&mut program(), &Settings::default()).unwrap();
        assert_eq!(reports.len(), 2);

        assert!(matches!(
            Pipeline::from_names(&["nope"], lookup),
            Err(Error::NoStages)
        ));
    }

    #[test]
    fn hook_errors_abort_the_pipeline() {
        let pipeline = Pipeline::from_names(&["failing", "strip-nops"], lookup).unwrap();
        let mut program = program();
        assert!(pipeline.run(&mut program, &Settings::default()).is_err());
        let code = program.classes[0].methods[0].code.as_ref().unwrap();
        assert_eq!(code.instructions.len(), 3);
    }
}
