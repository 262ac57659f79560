//! Command line for the experiment conductor

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{value_parser, Arg, Command};
use expt_conductor::{
    Conductor, ConductorConfig, Evaluation, FileSystemStorage, OutputEvent, Procedure,
    ProcedureDependents, StaticEnvironment, Variables,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

mod demo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Command::new("expt-conductor")
        .version(expt_conductor::VERSION)
        .about("Experiment conductor")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("TOML configuration file"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the demo sample-holder procedure")
                .arg(
                    Arg::new("consumers")
                        .long("consumers")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Number of acquisitions sharing the sample"),
                )
                .arg(
                    Arg::new("evaluation")
                        .long("evaluation")
                        .default_value("ordered")
                        .value_parser(|s: &str| s.parse::<Evaluation>())
                        .help("Sample admission policy"),
                )
                .arg(
                    Arg::new("storage")
                        .long("storage")
                        .help("Storage root (a temporary directory by default)"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("30")
                        .value_parser(value_parser!(u64))
                        .help("Seconds to wait for completion"),
                ),
        )
        .subcommand(
            Command::new("plan")
                .about("Print the dependencies of a procedure file")
                .arg(Arg::new("file").required(true).help("Procedure JSON file")),
        );

    let matches = cli.get_matches();
    let config = match matches.get_one::<String>("config") {
        Some(path) => {
            let source = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            ConductorConfig::from_toml_str(&source).with_context(|| format!("parsing {path}"))?
        }
        None => ConductorConfig::default(),
    };

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let consumers = args.get_one::<usize>("consumers").copied().unwrap_or(3);
            let evaluation = args.get_one::<Evaluation>("evaluation").copied().unwrap_or_default();
            let timeout = Duration::from_secs(args.get_one::<u64>("timeout").copied().unwrap_or(30));
            let root = match args.get_one::<String>("storage") {
                Some(root) => root.into(),
                None => std::env::temp_dir().join(format!("expt-conductor-{}", std::process::id())),
            };
            simulate(config, root, consumers, evaluation, timeout).await
        }
        Some(("plan", args)) => {
            let file = args
                .get_one::<String>("file")
                .context("missing procedure file")?;
            plan(file)
        }
        _ => {
            println!("No command given; try --help");
            Ok(())
        }
    }
}

async fn simulate(
    config: ConductorConfig,
    root: std::path::PathBuf,
    consumers: usize,
    evaluation: Evaluation,
    timeout: Duration,
) -> anyhow::Result<()> {
    println!("Simulating {consumers} acquisitions ({evaluation})");
    println!("Storage: {}", root.display());
    println!();

    let conductor = Arc::new(Conductor::new(
        Arc::new(FileSystemStorage::new(&root)),
        demo::registry(),
        Arc::new(StaticEnvironment::new()),
        config,
    ));
    let procedure = demo::procedure(consumers, evaluation)?;
    let mut events = conductor.output().subscribe();
    conductor.conduct(procedure)?;

    let waiter = Arc::clone(&conductor);
    let wait = tokio::task::spawn_blocking(move || waiter.await_completion(timeout));
    tokio::pin!(wait);
    let completed = loop {
        tokio::select! {
            finished = &mut wait => break finished?,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => println!("  ... {skipped} events skipped"),
                Err(RecvError::Closed) => {}
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    println!();

    conductor.clear()?;
    if completed {
        println!("All instructions completed");
        Ok(())
    } else {
        anyhow::bail!("timed out after {}s", timeout.as_secs())
    }
}

fn print_event(event: &OutputEvent) {
    match event {
        OutputEvent::Succeeded { sequence, successor } => {
            println!("output #{sequence}: {} instructions", successor.progress().len());
        }
        OutputEvent::ExecutionStarted { path, execution } => {
            println!("  started   {path} ({execution})");
        }
        OutputEvent::ExecutionCompleted { path, outcome, .. } => {
            println!("  completed {path}: {outcome:?}");
        }
    }
}

fn plan(file: &str) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
    let procedure: Procedure = serde_json::from_str(&source).with_context(|| format!("parsing {file}"))?;
    procedure.validate()?;
    let planned = ProcedureDependents::new(&procedure, &demo::registry(), &Variables::new())?;

    println!("Procedure '{}': {} instructions", procedure.id(), procedure.len());
    for path in procedure.paths() {
        let Some(dependencies) = planned.dependencies(path) else {
            continue;
        };
        let variables: Vec<_> = dependencies.declared_variables().collect();
        println!("  {path} variables [{}]", variables.join(", "));
        for dependency in dependencies.hand_offs().chain(dependencies.ordering()) {
            println!("    -> {} [{} {}]", dependency.to, dependency.kind, dependency.production);
        }
    }
    Ok(())
}
