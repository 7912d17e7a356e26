use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use hoardd::config::Config;
use hoardd::logging::LogControl;
use hoardd::server::Server;
use hoardd::shared::Shared;

const DEFAULT_CONFIG: &str = "/etc/hoardd.conf";

#[derive(Parser)]
#[command(name = "hoardd", version, about = "A memcached-compatible cache server")]
struct Options {
    /// Configuration file.
    #[arg(short = 'f', value_name = "FILE")]
    config: Option<PathBuf>,
}

fn load_config(options: &Options) -> Result<Config, hoardd::config::ConfigError> {
    match &options.config {
        Some(path) => Config::load(path),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Config::load(&default)
            } else {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
        }
    }
}

fn main() -> ExitCode {
    let options = Options::parse();

    let config = match load_config(&options) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(1);
        }
    };

    let log = match LogControl::init(&config.log) {
        Ok(log) => log,
        Err(error) => {
            eprintln!("cannot open the log file: {error}");
            return ExitCode::from(1);
        }
    };

    let workers = config.workers as usize;
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("cannot start the runtime: {error}");
            return ExitCode::from(1);
        }
    };

    let shared = Shared::new(config, log);
    match runtime.block_on(Server::new(shared).run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(cause) => {
            error!(%cause, "fatal error");
            eprintln!("{cause}");
            ExitCode::from(1)
        }
    }
}
