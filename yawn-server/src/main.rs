use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use yawn::logger::{self, AsyncLogger};
use yawn::Config;
use yawn_server::Server;

/// Epoll-based HTTP/1.1 static file server.
#[derive(Parser)]
#[command(name = "yawn-server", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(default_value = "./server.cfg")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let cfg = Config::load(&args.config);

    if cfg.get_bool("open_log", true) {
        let result = AsyncLogger::init(
            cfg.get_integer("log_type", 3) as u8,
            Path::new(&cfg.get_string("log_dir", "/tmp/yawn_logs")),
            &cfg.get_string("log_filename", "yawn"),
            cfg.get_integer("log_max_file_size", 20 * 1024 * 1024) as u64,
            logger::parse_level(&cfg.get_string("log_level", "info")),
            cfg.get_integer("log_queue_size", 1024) as usize,
        );
        if let Err(e) = result {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    }

    let mut server = match Server::new(&cfg) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Server initialization failed: {e}");
            eprintln!("Server initialization failed: {e}");
            AsyncLogger::close();
            return ExitCode::FAILURE;
        }
    };
    server.run();

    AsyncLogger::close();
    ExitCode::SUCCESS
}
