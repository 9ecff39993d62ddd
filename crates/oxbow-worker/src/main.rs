//! The worker runtime: started inside an activated environment, it
//! announces a rendezvous port on stdout, accepts one host connection and
//! serves `execute`/`run`/`exit` frames against the environment's own
//! Python interpreter.

mod interpreter;
mod server;

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use crate::interpreter::PythonInterpreter;

#[derive(Parser)]
#[command(
    name = "oxbow-worker",
    about = "Listens for execution orders inside an isolated environment"
)]
struct App {
    /// The name of the execution environment.
    environment: String,

    /// Directory receiving this worker's log file.
    #[clap(long)]
    instance_path: PathBuf,

    /// Open a debugger port in the interpreter; 0 picks a free port.
    #[clap(long)]
    debug_port: Option<u16>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn init_logging(args: &App) -> miette::Result<()> {
    fs_err::create_dir_all(&args.instance_path).into_diagnostic()?;
    let log_path = args
        .instance_path
        .join(format!("worker-{}.log", args.environment));
    let file = fs_err::File::create(log_path).into_diagnostic()?;

    let filter = EnvFilter::builder()
        .with_default_directive(args.verbose.tracing_level_filter().into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = App::parse();
    init_logging(&args)?;
    tracing::info!(environment = %args.environment, "worker starting");

    let interpreter = Box::new(PythonInterpreter::new());
    server::run(interpreter, args.debug_port.is_some())
        .await
        .into_diagnostic()?;

    tracing::info!(environment = %args.environment, "worker exiting");
    Ok(())
}
