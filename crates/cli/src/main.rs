//! Neutron CLI
//!
//! Command-line host for the compiler, VM, and process scheduler. There's
//! no lexer/parser in this workspace, so `run`/`scheduler-demo` drive a
//! fixed built-in program (see `programs.rs`) rather than a source file —
//! this binary exists to wire the pipeline together and exercise it end to
//! end, not to be a general-purpose interpreter front end.

mod programs;

use clap::{Parser as ClapParser, Subcommand};
use neutron_compiler::{Compiler, CompilerConfig};
use neutron_core::StringInterner;
use neutron_vm::{checkpoint, MailboxValue, ProcessBody, ProcessScheduler, ProcessTask, SchedulerConfig, Vm, VmConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

#[derive(ClapParser)]
#[command(name = "neutronc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Neutron bytecode VM and process scheduler host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run the built-in demo program, printing its result
    Run {
        /// Threshold (allocations) at which the garbage collector runs
        #[arg(long, default_value_t = 1024)]
        gc_threshold: usize,
    },

    /// Run the demo program, then save its global bindings to a checkpoint file
    CheckpointSave {
        /// Destination checkpoint file
        path: PathBuf,
    },

    /// Load a checkpoint file and print the globals it restores
    CheckpointLoad {
        /// Checkpoint file to read
        path: PathBuf,
    },

    /// Spawn a handful of processes on the scheduler and exchange messages
    SchedulerDemo {
        /// Number of worker processes to spawn
        #[arg(long, default_value_t = 4)]
        processes: usize,

        /// Size of the scheduler's worker-thread pool (defaults to NEUTRON_WORKERS or available parallelism)
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("neutronc=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { gc_threshold } => run_demo(gc_threshold),
        Commands::CheckpointSave { path } => run_checkpoint_save(&path),
        Commands::CheckpointLoad { path } => run_checkpoint_load(&path),
        Commands::SchedulerDemo { processes, workers } => run_scheduler_demo(processes, workers),
    }
}

fn build_demo_vm(gc_threshold: usize) -> (Vm, neutron_core::FunctionObj) {
    let mut vm = Vm::new(StringInterner::new(), VmConfig { gc_threshold });
    let program = programs::counter_demo();
    let (heap, interner) = vm.heap_and_interner_mut();
    let compiler = Compiler::new(heap, interner, CompilerConfig::default());
    let function = match compiler.compile_program(&program) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: demo program failed to compile: {e}");
            process::exit(1);
        }
    };
    (vm, function)
}

fn run_demo(gc_threshold: usize) {
    let (mut vm, function) = build_demo_vm(gc_threshold);
    match vm.interpret(function) {
        Ok(result) => println!("{}", result.stringify(vm.heap())),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn run_checkpoint_save(path: &PathBuf) {
    let (mut vm, function) = build_demo_vm(VmConfig::default().gc_threshold);
    if let Err(e) = vm.interpret(function) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
    if let Err(e) = checkpoint::write_checkpoint(path, &vm) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
    println!("Wrote checkpoint to {}", path.display());
}

fn run_checkpoint_load(path: &PathBuf) {
    let mut vm = Vm::new(StringInterner::new(), VmConfig::default());
    if let Err(e) = checkpoint::restore_checkpoint(path, &mut vm) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
    for (name, value) in vm.globals_snapshot() {
        println!("{name} = {}", value.stringify(vm.heap()));
    }
}

/// Spawns `processes` workers, each doubling a seeded number and reporting
/// it back to process 1 over a mailbox, then prints the scheduler's stats.
fn run_scheduler_demo(processes: usize, workers: Option<usize>) {
    let mut config = SchedulerConfig::default();
    if let Some(w) = workers {
        config.workers = w;
    }
    let mut scheduler = ProcessScheduler::new(config);

    let tasks: Arc<Mutex<HashMap<u64, ProcessTask>>> = Arc::new(Mutex::new(HashMap::new()));
    let tasks_for_spawn_fn = Arc::clone(&tasks);
    scheduler.start(move |pid| tasks_for_spawn_fn.lock().expect("task table poisoned").remove(&pid));

    let collector_pid = scheduler.spawn();
    tasks.lock().expect("task table poisoned").insert(
        collector_pid,
        ProcessTask { body: ProcessBody::Source(vec![]), args: vec![] },
    );

    let mut worker_pids = Vec::with_capacity(processes);
    for i in 0..processes {
        let pid = scheduler.spawn();
        tasks.lock().expect("task table poisoned").insert(
            pid,
            ProcessTask { body: ProcessBody::Source(programs::worker_body(i as f64)), args: vec![] },
        );
        worker_pids.push(pid);
    }

    for &pid in &worker_pids {
        scheduler.send(pid, collector_pid, MailboxValue::Number(pid as f64));
    }

    std::thread::sleep(Duration::from_millis(200));

    while let Some(msg) = scheduler.receive(collector_pid, Some(Duration::from_millis(10))) {
        info!(from = msg.from, "collector drained a leftover message");
    }

    let stats = scheduler.stats();
    println!(
        "spawned={} messages_delivered={} context_switches={}",
        stats.processes_spawned.load(std::sync::atomic::Ordering::Relaxed),
        stats.messages_delivered.load(std::sync::atomic::Ordering::Relaxed),
        stats.context_switches.load(std::sync::atomic::Ordering::Relaxed),
    );

    scheduler.stop();
}
