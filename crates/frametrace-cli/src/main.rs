use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Instant,
};

use clap::{Parser, Subcommand, ValueEnum};
use frametrace::{
    Backend, CompileCounter, Config, Eager, NoopTracer, Program, StderrTracer, StdPrint, TracerState, Value, Vm,
    VmTracer, compile, init_logging, optimize,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run host programs with frame tracing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a program inside an optimize context
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Source file to run
    file: PathBuf,

    /// Function to call (without arguments) after the module has run
    #[arg(long)]
    entry: Option<String>,

    /// Backend that compiles captured graphs
    #[arg(long, value_enum, default_value_t = BackendKind::Eager)]
    backend: BackendKind,

    /// Override a configuration option, e.g. `--set dynamic_shapes=true`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// JSON configuration document, applied before environment overrides
    #[arg(long, value_name = "FILE.json")]
    config: Option<PathBuf>,

    /// Print every compiled graph when done
    #[arg(long, default_value_t = false)]
    print_graphs: bool,

    /// Print tracer counters as JSON when done
    #[arg(long, default_value_t = false)]
    stats: bool,

    /// Number of times to run the module, or the entry function
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Log executed instructions to stderr, up to this many
    #[arg(long, value_name = "LIMIT")]
    trace_instructions: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum BackendKind {
    Eager,
    Count,
}

fn main() -> ExitCode {
    let Cli {
        command: Command::Run(args),
    } = Cli::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &RunArgs) -> Result<(), String> {
    let config = load_config(args)?;
    init_logging(config.log_level);
    let source = read_file(&args.file)?;
    let filename = args.file.to_string_lossy();
    let program = compile(&source, &filename).map_err(|err| err.to_string())?;
    log::debug!(target: "frametrace", "compiled {filename}, running with the {:?} backend", args.backend);

    let state = TracerState::new(config);
    let counter = Arc::new(CompileCounter::new());
    let backend: Arc<dyn Backend> = match args.backend {
        BackendKind::Eager => Arc::new(Eager),
        BackendKind::Count => counter.clone(),
    };
    let ctx = optimize(&state, backend);
    let _scope = ctx.enter();

    let mut print = StdPrint::new();
    let start = Instant::now();
    match args.trace_instructions {
        Some(limit) => execute(&mut Vm::new(&mut print, StderrTracer::with_limit(limit)), &program, args)?,
        None => execute(&mut Vm::new(&mut print, NoopTracer), &program, args)?,
    }
    print.flush();
    let elapsed = start.elapsed();
    eprintln!("success after: {elapsed:?}");

    if args.print_graphs {
        for graph in state.graphs() {
            println!("{}:\n{}", graph.name(), graph.graph());
        }
    }
    if args.stats {
        let mut stats = serde_json::to_value(state.stats()).map_err(|err| err.to_string())?;
        if args.backend == BackendKind::Count {
            stats["backend_frames"] = counter.frame_count().into();
            stats["backend_ops"] = counter.op_count().into();
        }
        let text = serde_json::to_string_pretty(&stats).map_err(|err| err.to_string())?;
        println!("{text}");
    }
    Ok(())
}

/// Runs the module, then the entry function if one was named.
fn execute<Tr: VmTracer>(vm: &mut Vm<'_, Tr>, program: &Program, args: &RunArgs) -> Result<(), String> {
    let Some(entry) = &args.entry else {
        for _ in 0..args.repeat {
            vm.run_program(program).map_err(|err| err.to_string())?;
        }
        return Ok(());
    };
    let globals = vm.run_program(program).map_err(|err| err.to_string())?;
    let Some(f) = globals.borrow().get(entry.as_str()).cloned() else {
        return Err(format!("{} defines no `{entry}`", args.file.display()));
    };
    for _ in 0..args.repeat {
        let result = vm.call(&f, Vec::new()).map_err(|err| err.to_string())?;
        if !matches!(result, Value::None) {
            println!("{result}");
        }
    }
    Ok(())
}

/// Defaults, then the JSON document, then `FRAMETRACE_*` variables, then `--set`.
fn load_config(args: &RunArgs) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => Config::from_json(&read_file(path)?).map_err(|err| err.to_string())?,
        None => Config::default(),
    };
    config.apply_env(std::env::vars()).map_err(|err| err.to_string())?;
    for assignment in &args.set {
        config.set_assignment(assignment).map_err(|err| err.to_string())?;
    }
    Ok(config)
}

fn read_file(path: &Path) -> Result<String, String> {
    match fs::metadata(path) {
        Ok(metadata) if !metadata.is_file() => return Err(format!("{} is not a file", path.display())),
        Ok(_) => {}
        Err(err) => return Err(format!("reading {}: {err}", path.display())),
    }
    fs::read_to_string(path).map_err(|err| format!("reading {}: {err}", path.display()))
}
