use clap::{App, Arg, ErrorKind};
use std::io;
use std::path::Path;
use tlox::{Lox, Status};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    let matches = match App::new("tlox")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tree-walking interpreter for Lox")
        .arg(
            Arg::with_name("script")
                .help("Script to run. Starts a prompt when omitted.")
                .index(1),
        )
        .arg(
            Arg::with_name("print-ast")
                .long("print-ast")
                .help("Print each parsed program to stderr before running it"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Log more; repeat for more detail. RUST_LOG overrides this."),
        )
        .get_matches_safe()
    {
        Ok(matches) => matches,
        Err(e) => match e.kind {
            ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => e.exit(),
            _ => {
                eprintln!("{}", e.message);
                exit(Status::Usage);
            }
        },
    };

    init_tracing(matches.occurrences_of("verbose"));

    let mut lox = Lox::new().print_ast(matches.is_present("print-ast"));
    let status = match matches.value_of("script") {
        Some(script) => lox.run_file(Path::new(script)),
        None => run_prompt(&mut lox),
    };
    exit(status);
}

fn run_prompt(lox: &mut Lox) -> Status {
    let stdin = io::stdin();
    let stdout = io::stdout();
    match lox.run_prompt(&mut stdin.lock(), &mut stdout.lock()) {
        Ok(()) => Status::Success,
        Err(e) => {
            error!(error = %e, "prompt failed");
            Status::IoError
        }
    }
}

fn init_tracing(verbosity: u64) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tlox={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

fn exit(status: Status) -> ! {
    std::process::exit(status.exit_code())
}
