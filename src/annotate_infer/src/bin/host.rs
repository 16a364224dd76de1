#![deny(warnings)]
use annotate_infer::{cli, host::run_host};
use clap::{App, Arg};
use std::io::{self, BufReader};
use worker_proc::Launcher;

fn main() {
    let matches = App::new("Inference Host")
        .about("Serves the host service on stdio and proxies inference to a backend process")
        .arg(
            Arg::with_name("backend")
                .short("b")
                .long("backend")
                .help("Shell command starting the inference backend")
                .default_value("echo-backend")
                .takes_value(true),
        )
        .get_matches();

    cli::init_logger();
    let backend = matches.value_of("backend").unwrap_or("echo-backend");
    log::info!("host up, backend: {}", backend);
    let reader = BufReader::new(io::stdin());
    if let Err(e) = run_host(reader, io::stdout(), Launcher::remote(backend)) {
        log::error!("host stopped: {}", e);
        std::process::exit(1);
    }
}
