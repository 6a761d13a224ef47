//! Hand-off points to the tools that run after deobfuscation.

use std::io;
use std::path::Path;
use std::process::Command;

use log::{debug, info};

use crate::error::{Error, Result};

/// Turns a jar into source files.
pub trait Decompiler: Send + Sync {
    fn decompile(&self, jar: &Path, out_dir: &Path) -> Result<()>;
}

/// Post-processes decompiled sources in place.
pub trait SourceCleaner: Send + Sync {
    fn clean(&self, dir: &Path, passes: &[String]) -> Result<()>;
}

/// Runs a decompiler command line with the jar and output directory appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDecompiler {
    program: String,
    args: Vec<String>,
}

impl ExternalDecompiler {
    /// Splits `command` on whitespace; the first word is the program.
    pub fn new(command: &str) -> Option<ExternalDecompiler> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(ExternalDecompiler {
            program,
            args: words.collect(),
        })
    }
}

impl Decompiler for ExternalDecompiler {
    fn decompile(&self, jar: &Path, out_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(out_dir).map_err(|err| Error::io(out_dir, err))?;
        debug!("Running {} {:?} {:?} {:?}", self.program, self.args, jar, out_dir);
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(jar)
            .arg(out_dir)
            .status()
            .map_err(|err| Error::io(&self.program, err))?;
        if !status.success() {
            return Err(Error::io(
                &self.program,
                io::Error::new(io::ErrorKind::Other, format!("decompiler exited with {}", status)),
            ));
        }
        info!("Decompiled {:?} into {:?}", jar, out_dir);
        Ok(())
    }
}
