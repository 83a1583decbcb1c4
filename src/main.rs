// src/main.rs
use std::path::Path;
use std::process::ExitCode;

use vigil_web::hooks::Hooks;
use vigil_web::{Config, Server, init_logging};

fn main() -> ExitCode {
    init_logging();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match Config::load(Path::new(&path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("vigil-web: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    tracing::info!(bind = %config.bind, web_root = %config.web_root.display(), "starting");

    match Server::new(config, Hooks::defaults()).serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vigil-web: {}", e);
            ExitCode::FAILURE
        }
    }
}
