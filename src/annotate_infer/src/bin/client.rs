#![deny(warnings)]
use annotate_infer::cli;
use clap::{App, Arg, ArgMatches};
use orchestrator::{Builder, Calls, Check, HostConfig};
use std::{path::Path, thread};
use wire::{Capability, Value};
use worker_proc::{Handle, Launcher, Promise};

fn parse_value(s: &str) -> Value {
    if let Ok(v) = s.parse::<i64>() {
        Value::from(v)
    } else if let Ok(v) = s.parse::<f64>() {
        Value::from(v)
    } else if let Ok(v) = s.parse::<bool>() {
        Value::from(v)
    } else {
        Value::from(s)
    }
}

fn setup_config(matches: &ArgMatches) -> Result<Value, String> {
    let mut entries = vec![];
    for pair in matches.values_of("config").into_iter().flatten() {
        let mut split = pair.splitn(2, '=');
        match (split.next(), split.next()) {
            (Some(key), Some(value)) if !key.is_empty() => {
                entries.push((Value::from(key), parse_value(value)))
            }
            _ => return Err(format!("expected KEY=VALUE, got {:?}", pair)),
        }
    }
    Ok(Value::Map(entries))
}

fn infer(handle: &Handle, capability: Capability, file: &Path) -> Promise<Value> {
    match capability {
        Capability::Caption => handle.caption(file, Value::Nil),
        Capability::Tag => handle.tag(file, Value::Nil),
        Capability::Mask => handle.mask(file, Value::Nil),
        Capability::Embed => handle.embed_img(file, Value::Nil),
        Capability::Upscale => handle.imgfile_upscale(file, Value::Nil),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("{}", message);
    std::process::exit(2);
}

fn main() {
    let matches = App::new("Annotate Client")
        .about("Runs one capability over image files on a pool of worker hosts")
        .arg(
            Arg::with_name("local")
                .short("l")
                .long("local")
                .help("Command of a worker started on this machine, images are read by path")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("remote")
                .short("r")
                .long("remote")
                .help("Shell command reaching a remote inference host, images are uploaded")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("capability")
                .short("c")
                .long("capability")
                .help("One of caption, tag, mask, embed, upscale")
                .default_value("caption")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .short("o")
                .long("config")
                .help("Setup field as KEY=VALUE")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("queue_size")
                .short("q")
                .long("queue-size")
                .help("Files in flight per host")
                .default_value("2")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .help("Abort after the interval elapsed, use value[s|ms|us|ns], e.g. 30s")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("files")
                .help("Image files")
                .multiple(true)
                .required(true),
        )
        .get_matches();

    cli::init_logger();
    let capability = matches
        .value_of("capability")
        .and_then(Capability::parse)
        .unwrap_or_else(|| fail("unknown capability"));
    let queue_size = matches
        .value_of("queue_size")
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| fail("queue size must be a number"));
    let config = setup_config(&matches).unwrap_or_else(|e| fail(&e));

    let mut builder = Builder::new();
    for (i, command) in matches.values_of("local").into_iter().flatten().enumerate() {
        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or_else(|| fail("empty local worker command"));
        let launcher = Launcher::local(program, words);
        builder = builder.host(HostConfig::new(format!("local-{}", i), launcher).queue_size(queue_size));
    }
    for (i, command) in matches.values_of("remote").into_iter().flatten().enumerate() {
        let launcher = Launcher::remote(command);
        builder = builder.host(HostConfig::new(format!("remote-{}", i), launcher).queue_size(queue_size));
    }
    let pool = builder.build();
    if pool.host_names().is_empty() {
        fail("no hosts given, use --local or --remote");
    }

    let mut session = match pool.create_session(usize::MAX) {
        Ok(session) => session,
        Err(e) => fail(&e.to_string()),
    };
    session.prepare(
        move |handle| handle.setup(capability, config.clone()),
        |host, error| match error {
            Some(e) => eprintln!("{}: not available: {}", host, e),
            None => log::info!("{}: prepared", host),
        },
    );
    if let Some(timeout) = matches.value_of("timeout") {
        let timeout = cli::parse_duration(timeout).unwrap_or_else(|| fail("invalid timeout"));
        let abort = session.abort_handle();
        thread::spawn(move || {
            thread::sleep(timeout);
            log::warn!("timeout elapsed, aborting");
            abort.abort();
        });
    }

    let files: Vec<String> = matches
        .values_of("files")
        .into_iter()
        .flatten()
        .map(str::to_owned)
        .collect();
    let check = move |file: &Path, _: &Handle| {
        let file = file.to_owned();
        Check::run(move |handle| Ok(Calls::wait(vec![infer(handle, capability, &file)])))
    };
    let results = match session.queue_files(files, check, true) {
        Ok(results) => results,
        Err(e) => fail(&e.to_string()),
    };
    let mut failed = 0;
    for result in results {
        match result.error {
            Some(e) => {
                failed += 1;
                println!("{}\terror: {}", result.file.display(), e);
            }
            None => {
                let values: Vec<String> = result.results.iter().map(Value::to_string).collect();
                println!("{}\t{}", result.file.display(), values.join(" "));
            }
        }
    }
    if failed > 0 {
        std::process::exit(1);
    }
}
