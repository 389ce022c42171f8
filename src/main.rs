// src/main.rs
use std::process;

use clap::Parser;
use log::error;

use ravel::config::Config;
use ravel::logger::Logger;
use ravel::server::Server;

const LOG_ROTATE_LINES: u64 = 800_000;
const LOG_QUEUE_SIZE: usize = 800;

fn main() {
    // clap exits with code 2 on argv errors.
    let config = Config::parse();

    if config.log_off == 0 {
        let queue_size = if config.log_async == 1 { LOG_QUEUE_SIZE } else { 0 };
        if let Err(err) = Logger::init(&config.log_path(), LOG_ROTATE_LINES, queue_size) {
            eprintln!("ravel: logger init failed: {}", err);
            process::exit(1);
        }
    }

    let mut server = match Server::bind(config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("ravel: {}", err);
            error!("startup failed: {}", err);
            process::exit(1);
        }
    };
    if let Err(err) = server.run() {
        error!("event loop failed: {}", err);
        process::exit(1);
    }
}
