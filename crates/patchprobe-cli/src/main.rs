use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use patchprobe_collector::{write_results, InstrumentationSpec, LaunchRequest};
use patchprobe_config::{init_tracing, CollectorConfig, PatchprobeConfig, SpecFormat};
use patchprobe_matched_lines::{MapperError, MatchRequest};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "patchprobe",
    version,
    about = "Record runtime state around a patch (JDWP collection, matched-line mapping)"
)]
struct Cli {
    /// TOML configuration file (defaults to $PATCHPROBE_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log level or `EnvFilter` directive, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run tests under the debugger and record state at instrumented lines
    Collect(CollectArgs),
    /// Compute breakpoint lines and an exit watch from two revisions of a file
    MatchedLines(MatchedLinesArgs),
}

#[derive(Args)]
struct CollectArgs {
    /// Classpath entries of the project under test (repeatable or `:`-separated)
    #[arg(long, required = true, value_delimiter = ':')]
    classpath: Vec<PathBuf>,
    /// Test classes (or `Class::method`) handed to the runner
    #[arg(long, required = true, num_args = 1..)]
    tests: Vec<String>,
    /// Breakpoint spec (text `Type=1,2` lines or JSON)
    #[arg(long)]
    breakpoints: Option<PathBuf>,
    /// Exit-watch spec (`{"name": .., "className": ..}`)
    #[arg(long)]
    exit_watch: Option<PathBuf>,
    /// Directory receiving breakpoints.json and method-exits.json
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    #[arg(long)]
    stack_trace_depth: Option<usize>,
    #[arg(long)]
    execution_depth: Option<usize>,
    /// Array elements rendered per array
    #[arg(long)]
    array_elements: Option<usize>,
    /// Capture local variables only
    #[arg(long)]
    skip_fields: bool,
}

#[derive(Args)]
struct MatchedLinesArgs {
    /// Root of the git repository
    project: PathBuf,
    /// The patched Java file, relative to the project
    file: PathBuf,
    /// Revision before the patch
    left_revision: String,
    /// Revision after the patch
    right_revision: String,
    /// Breakpoint spec encoding (defaults to the configuration)
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
    /// Directory receiving input-left.txt, input-right.txt and methods.json
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Text,
}

impl From<FormatArg> for SpecFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Json => SpecFormat::Json,
            FormatArg::Text => SpecFormat::Text,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = PatchprobeConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_tracing(&config.logging);

    match cli.command {
        Command::Collect(args) => collect(config, args),
        Command::MatchedLines(args) => matched_lines(config, args),
    }
}

fn apply_overrides(collector: &mut CollectorConfig, args: &CollectArgs) {
    if let Some(depth) = args.stack_trace_depth {
        collector.stack_trace_depth = depth;
    }
    if let Some(depth) = args.execution_depth {
        collector.execution_depth = depth;
    }
    if let Some(elements) = args.array_elements {
        collector.array_elements = elements;
    }
    collector.skip_fields |= args.skip_fields;
}

fn collect(mut config: PatchprobeConfig, args: CollectArgs) -> Result<i32> {
    if args.breakpoints.is_none() && args.exit_watch.is_none() {
        bail!("nothing to instrument: pass --breakpoints and/or --exit-watch");
    }
    apply_overrides(&mut config.collector, &args);
    let spec = InstrumentationSpec::load(args.breakpoints.as_deref(), args.exit_watch.as_deref())
        .context("failed to load the instrumentation spec")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || on_interrupt.cancel())
        .context("failed to install the Ctrl-C handler")?;

    let request = LaunchRequest {
        classpath: args.classpath,
        tests: args.tests,
    };
    let results = patchprobe_collector::run(&config, &request, &spec, &cancel)
        .context("runtime state collection failed")?;
    let paths = write_results(&args.output_dir, &results)
        .with_context(|| format!("failed to write results to {}", args.output_dir.display()))?;

    if cancel.is_cancelled() {
        tracing::warn!(target = "patchprobe.cli", "interrupted; results are partial");
    }
    println!("{}", paths.breakpoints.display());
    println!("{}", paths.method_exits.display());
    Ok(0)
}

fn matched_lines(mut config: PatchprobeConfig, args: MatchedLinesArgs) -> Result<i32> {
    if let Some(format) = args.format {
        config.matched_lines.format = format.into();
    }
    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    let request = MatchRequest {
        project: args.project,
        file: args.file,
        left_revision: args.left_revision,
        right_revision: args.right_revision,
        output_dir: args.output_dir,
    };

    match patchprobe_matched_lines::run(&config.matched_lines, &cwd, &request) {
        Ok(outputs) => {
            println!("{}", outputs.left.display());
            println!("{}", outputs.right.display());
            println!("{}", outputs.methods.display());
            Ok(0)
        }
        // The patch cannot be analyzed; not a tool failure.
        Err(
            err @ (MapperError::NoDiff
            | MapperError::AmbiguousPatchLocation { .. }
            | MapperError::SignatureChanged { .. }
            | MapperError::NoEnclosingMember),
        ) => {
            eprintln!("{err}");
            Ok(1)
        }
        Err(err) => Err(err).with_context(|| {
            format!("failed to map {} in {}", request.file.display(), request.project.display())
        }),
    }
}
