//! HIPSR wideband spectrometer server.
//!
//! Connects to the signal-processing board fleet, listens for TCS commands,
//! reads accumulated spectra on every integration and writes them to the
//! observation archive while streaming previews to the GUI.

use clap::Parser;

use anyhow::Result;

mod guard;
mod logging;
mod preview;
mod supervisor;
mod tcs;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Firmware flavour to run.
    #[arg(short = 'f', long, default_value = "hipsr_400_8192")]
    flavour: String,
    /// Skip reprogramming and reconfiguring the boards.
    #[arg(short = 's', long)]
    skip: bool,
    /// Test mode: write to ./test and listen locally for the dummy TCS
    /// script.
    #[arg(short = 't', long)]
    test: bool,
    /// Dummy mode: synthetic boards, no hardware touched.
    #[arg(short = 'd', long)]
    dummy: bool,
    /// Verbose (debug) logging.
    #[arg(short = 'v', long)]
    verbose: bool,
    /// Configuration file (TOML). Built-in defaults are used when absent.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Open a new archive file on every `start` command.
    #[arg(long)]
    new_file_each_obs: bool,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Cli::parse();
    logging::init(args.verbose);

    if let Err(dup) = guard::check_single_instance() {
        eprintln!("{}", dup);
        std::process::exit(2);
    }

    let mut cfg = match &args.config {
        Some(path) => hipsr_config::parse_config_file(path)?,
        None => hipsr_config::ServerConfig::default(),
    };
    if args.test {
        cfg.data_dir = std::path::PathBuf::from("./test");
        cfg.tcs_server = "127.0.0.1".to_string();
        cfg.tcs_port = 8080;
        cfg.plotter_host = "127.0.0.1".to_string();
    }
    if args.new_file_each_obs {
        cfg.new_file_each_obs = true;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("hipsr-runtime")
        .build()?;

    // This runs the whole thing and blocks until shutdown.
    let exit = runtime.block_on(supervisor::run(cfg, args))?;

    match exit {
        supervisor::ExitKind::Clean => Ok(()),
        supervisor::ExitKind::Crashed => std::process::exit(1),
    }
}
