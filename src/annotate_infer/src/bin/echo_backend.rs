#![deny(warnings)]
use annotate_infer::{cli, echo::echo_service};
use clap::App;
use std::io::{self, BufReader};
use wire::{FrameWriter, Multiplexer};

fn main() {
    App::new("Echo Backend")
        .about("Inference backend answering every command without loading models")
        .get_matches();

    cli::init_logger();
    let mut mux = Multiplexer::new(echo_service(), FrameWriter::new(io::stdout()));
    if let Err(e) = mux.serve(BufReader::new(io::stdin())) {
        log::error!("backend stopped: {}", e);
        std::process::exit(1);
    }
}
