use std::path::PathBuf;

use anyhow::{Context, Result};
use log::LevelFilter;
use structopt::StructOpt;

use jdeob::{Deobfuscator, DeobfuscatorOptions};

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "jdeob", about = "Removes obfuscation from a jar of class files")]
struct Opt {
    /// Input jar
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Output jar
    #[structopt(parse(from_os_str))]
    output: PathBuf,

    /// Comma separated stages to run, in order. Runs the default profile when omitted
    #[structopt(short = "s", long = "stages", use_delimiter = true)]
    stages: Vec<String>,

    /// Name table file. Read before renaming and rewritten with every new name
    #[structopt(long = "remap-file", parse(from_os_str))]
    remap_file: Option<PathBuf>,

    /// Package given to classes left in the default package
    #[structopt(long = "default-package", default_value = "deob")]
    default_package: String,

    /// Class receiving the relocated static fields
    #[structopt(long = "statics-class", default_value = "Statics")]
    statics_class: String,

    /// Directory to decompile the output jar into
    #[structopt(long = "decompile-dir", parse(from_os_str))]
    decompile_dir: Option<PathBuf>,

    /// Decompiler command line. The output jar and decompile directory are appended
    #[structopt(long = "decompiler")]
    decompiler: Option<String>,

    /// Write per-stage statistics to this CSV file
    #[structopt(long = "stats", parse(from_os_str))]
    stats: Option<PathBuf>,

    /// Write per-method block graphs in dot format to this directory
    #[structopt(short = "g", long = "graphs", parse(from_os_str))]
    graphs: Option<PathBuf>,

    /// Worker threads for method-local stages
    #[structopt(short = "j", long = "threads")]
    threads: Option<usize>,

    /// Dry run only -- do not write any files
    #[structopt(long = "dry")]
    dry: bool,

    /// Enable verbose logging
    #[structopt(short = "v")]
    verbose: bool,

    /// Enable verbose debug logging
    #[structopt(long = "trace")]
    trace: bool,

    /// Disable all logging
    #[structopt(short = "q")]
    quiet: bool,
}

fn init_logging(opt: &Opt) -> Result<()> {
    let logger = if opt.quiet {
        return Ok(());
    } else if opt.trace {
        simple_logger::SimpleLogger::new()
            .with_level(LevelFilter::Trace)
            .with_module_level("jdeob::code_graph", LevelFilter::Debug)
    } else if opt.verbose {
        simple_logger::SimpleLogger::new().with_level(LevelFilter::Debug)
    } else {
        simple_logger::SimpleLogger::new().with_level(LevelFilter::Info)
    };
    logger.init().context("failed to initialize logging")
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    init_logging(&opt)?;

    let defaults = DeobfuscatorOptions::default();
    let options = DeobfuscatorOptions {
        input: opt.input.clone(),
        output: opt.output.clone(),
        stages: opt.stages.clone(),
        name_table: opt.remap_file.clone(),
        default_package: opt.default_package.clone(),
        statics_class: opt.statics_class.clone(),
        decompile_dir: opt.decompile_dir.clone(),
        decompiler: opt.decompiler.clone(),
        stats: opt.stats.clone(),
        graphs_dir: opt.graphs.clone(),
        threads: opt.threads.unwrap_or(defaults.threads),
        dry: opt.dry,
    };

    let reports = Deobfuscator::new(options)
        .run()
        .with_context(|| format!("failed to deobfuscate {:?}", opt.input))?;

    let passes: usize = reports.iter().map(|report| report.passes).sum();
    println!("Ran {} stages over {:?} in {} passes", reports.len(), opt.input, passes);

    Ok(())
}
