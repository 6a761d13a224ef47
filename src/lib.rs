use std::path::PathBuf;

use log::{error, info};

use crate::decompiler::{Decompiler, ExternalDecompiler, SourceCleaner};
use crate::error::Result;
use crate::pipeline::{Settings, StageReport};
use crate::program::Program;

/// Jar reading and writing
pub mod archive;
/// Class file decoding and encoding
pub mod classfile;
/// Basic block graphs and control flow normalization
pub mod code_graph;
/// Decompiler and source cleanup hand-off
pub mod decompiler;
/// Stage driver
pub mod deob;
/// Errors
pub mod error;
/// Instruction lists
pub mod insn;
/// Instruction sequence patterns
pub mod matcher;
/// The name table file shared between runs
pub mod name_table;
pub mod opcodes;
/// Transform contract and fixed point driver
pub mod pipeline;
/// Classes, members and their code
pub mod program;
/// Inheritance-aware renaming and member relocation
pub mod remap;
/// Per-stage statistics output
pub mod report;
/// Stage registry and obfuscation pattern removers
pub mod transforms;
/// Splitting of reused local variable slots
pub mod var_splitter;

/// Everything a deobfuscation run needs to know.
#[derive(Debug, Clone)]
pub struct DeobfuscatorOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Stage names in run order; empty runs the default profile
    pub stages: Vec<String>,
    pub name_table: Option<PathBuf>,
    pub default_package: String,
    pub statics_class: String,
    /// Directory the decompiler writes sources to
    pub decompile_dir: Option<PathBuf>,
    /// Decompiler command line, receiving the output jar and `decompile_dir`
    pub decompiler: Option<String>,
    /// CSV file receiving per-stage statistics
    pub stats: Option<PathBuf>,
    pub graphs_dir: Option<PathBuf>,
    pub threads: usize,
    pub dry: bool,
}

impl Default for DeobfuscatorOptions {
    fn default() -> Self {
        let settings = Settings::default();
        DeobfuscatorOptions {
            input: PathBuf::new(),
            output: PathBuf::new(),
            stages: Vec::new(),
            name_table: None,
            default_package: settings.default_package,
            statics_class: settings.statics_class,
            decompile_dir: None,
            decompiler: None,
            stats: None,
            graphs_dir: None,
            threads: num_cpus::get(),
            dry: false,
        }
    }
}

pub struct Deobfuscator {
    options: DeobfuscatorOptions,
    decompiler: Option<Box<dyn Decompiler>>,
    cleaner: Option<(Box<dyn SourceCleaner>, Vec<String>)>,
}

impl Deobfuscator {
    /// Creates a deobfuscator. A decompiler command in `options` becomes an
    /// [`ExternalDecompiler`].
    pub fn new(options: DeobfuscatorOptions) -> Deobfuscator {
        let decompiler = options
            .decompiler
            .as_deref()
            .and_then(ExternalDecompiler::new)
            .map(|decompiler| Box::new(decompiler) as Box<dyn Decompiler>);
        Deobfuscator {
            options,
            decompiler,
            cleaner: None,
        }
    }

    /// Consumes the current Deobfuscator and returns one handing its output
    /// to `decompiler` instead.
    pub fn with_decompiler(mut self, decompiler: Box<dyn Decompiler>) -> Deobfuscator {
        self.decompiler = Some(decompiler);
        self
    }

    /// Runs `cleaner` with `passes` over the decompiled sources.
    pub fn with_cleaner(mut self, cleaner: Box<dyn SourceCleaner>, passes: Vec<String>) -> Deobfuscator {
        self.cleaner = Some((cleaner, passes));
        self
    }

    pub fn settings(&self) -> Settings {
        Settings {
            name_table: self.options.name_table.clone(),
            default_package: self.options.default_package.clone(),
            statics_class: self.options.statics_class.clone(),
            graphs_dir: self.options.graphs_dir.clone(),
            dry: self.options.dry,
            ..Settings::default()
        }
    }

    /// Runs the stages over `program` on this deobfuscator's worker pool.
    pub fn deobfuscate(&self, program: &mut Program) -> Result<Vec<StageReport>> {
        let settings = self.settings();
        if let Some(dir) = settings.graphs_dir.as_ref().filter(|_| !settings.dry) {
            std::fs::create_dir_all(dir).map_err(|err| error::Error::io(dir, err))?;
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.threads)
            .build()?;
        pool.install(|| deob::deobfuscate(program, &self.options.stages, &settings))
    }

    /// Reads the input jar, deobfuscates it and writes the results.
    pub fn run(&self) -> Result<Vec<StageReport>> {
        let archive::Archive { mut program, resources } = archive::read_archive(&self.options.input)?;
        info!(
            "Read {} classes from {:?}",
            program.classes.len(),
            self.options.input
        );
        let reports = self.deobfuscate(&mut program)?;
        if self.options.dry {
            info!("Dry run, not writing any output");
            return Ok(reports);
        }

        archive::write_archive(&self.options.output, &program, &resources)?;
        info!("Wrote {:?}", self.options.output);
        if let (Some(path), Some(table)) = (&self.options.name_table, &program.name_table) {
            table.write(path)?;
            info!("Wrote {} name table entries to {:?}", table.len(), path);
        }
        if let Some(path) = &self.options.stats {
            report::write_stats(path, &reports)?;
        }

        if let Some(dir) = &self.options.decompile_dir {
            match &self.decompiler {
                Some(decompiler) => match decompiler.decompile(&self.options.output, dir) {
                    Ok(()) => {
                        if let Some((cleaner, passes)) = &self.cleaner {
                            if let Err(err) = cleaner.clean(dir, passes) {
                                error!("Cleaning sources in {:?} failed: {}", dir, err);
                            }
                        }
                    }
                    Err(err) => error!("Decompiling {:?} failed: {}", self.options.output, err),
                },
                None => error!("No decompiler configured, not decompiling into {:?}", dir),
            }
        }
        Ok(reports)
    }
}
