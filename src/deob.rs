//! Runs a list of stages over a program.

use log::{info, warn};

use crate::error::Result;
use crate::pipeline::{Pipeline, Settings, StageReport};
use crate::program::Program;
use crate::transforms::{self, DEFAULT_PROFILE};

/// Builds the pipeline for `stages`, falling back to the default profile
/// when none are named. Unknown names are logged and skipped.
pub fn pipeline<N: AsRef<str>>(stages: &[N]) -> Result<Pipeline> {
    if stages.iter().all(|stage| stage.as_ref().trim().is_empty()) {
        return Pipeline::from_names(DEFAULT_PROFILE, transforms::lookup);
    }
    Pipeline::from_names(stages, transforms::lookup)
}

/// Deobfuscates `program` in place and returns one report per stage run.
pub fn deobfuscate<N: AsRef<str>>(program: &mut Program, stages: &[N], settings: &Settings) -> Result<Vec<StageReport>> {
    let pipeline = pipeline(stages)?;
    info!(
        "Deobfuscating {} classes with stages {}",
        program.classes.len(),
        pipeline.names().join(",")
    );
    let reports = pipeline.run(program, settings)?;

    let passes: usize = reports.iter().map(|report| report.passes).sum();
    let slowest = reports.iter().max_by_key(|report| report.passes);
    if let Some(slowest) = slowest.filter(|report| report.passes > 100) {
        warn!("{} needed {} passes", slowest.stage, slowest.passes);
    }
    info!("Finished {} stages in {} passes", reports.len(), passes);
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::insn::tests::mnemonics;
    use crate::insn::{Insn, InstructionList};
    use crate::opcodes::*;
    use crate::program::{AccessFlags, ClassUnit, Code, MethodUnit};

    fn program() -> Program {
        let mut list = InstructionList::new();
        let end = list.create_label();
        list.push(Insn::Jump { opcode: GOTO, target: end });
        list.push(Insn::Simple(NOP));
        list.append(end.id());
        list.push(Insn::Simple(RETURN));

        let mut method = MethodUnit::new("Main", "main", "([Ljava/lang/String;)V", AccessFlags::PUBLIC | AccessFlags::STATIC);
        method.code = Some(Code {
            instructions: list,
            max_locals: 1,
            ..Code::default()
        });
        let mut class = ClassUnit::new("Main", Some("java/lang/Object"), AccessFlags::PUBLIC);
        class.methods.push(method);
        Program::new(vec![class])
    }

    #[test]
    fn empty_stage_list_means_default_profile() {
        let none: [&str; 0] = [];
        assert_eq!(pipeline(&none).unwrap().names(), DEFAULT_PROFILE);
        assert_eq!(pipeline(&[" "]).unwrap().names(), DEFAULT_PROFILE);
        assert_eq!(pipeline(&["monitor", "bogus"]).unwrap().names(), vec!["monitor"]);
        assert!(matches!(pipeline(&["bogus"]), Err(Error::NoStages)));
    }

    #[test]
    fn default_profile_cleans_a_program() {
        let mut program = program();
        let reports = deobfuscate(&mut program, &[] as &[&str], &Settings::default()).unwrap();
        assert_eq!(reports.len(), DEFAULT_PROFILE.len());

        let main = program.class("deob/Main").unwrap();
        let code = main.method("main", "([Ljava/lang/String;)V").unwrap().code.as_ref().unwrap();
        assert_eq!(mnemonics(&code.instructions), vec!["RETURN"]);
    }
}
