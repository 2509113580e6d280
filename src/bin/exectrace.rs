use clap::{crate_version, App, AppSettings, Arg};
use std::path::Path;

use exectrace::logging;
use exectrace::supervisor;

fn main() {
    logging::init();

    let matches = App::new("exectrace")
        .about("Trace a command, recording file, process and network provenance.")
        .version(crate_version!())
        .setting(AppSettings::TrailingVarArg)
        .arg(
            Arg::with_name("database")
                .short("d")
                .long("database")
                .takes_value(true)
                .default_value("trace.db")
                .help("Event log this run is appended to"),
        )
        .arg(
            Arg::with_name("command")
                .required(true)
                .multiple(true)
                .help("Command to run and its arguments"),
        )
        .get_matches();

    let database = matches.value_of("database").unwrap_or("trace.db");
    let command: Vec<String> = matches
        .values_of("command")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();

    match supervisor::fork_and_trace(&command[0], &command, Path::new(database)) {
        Ok(status) => {
            if status & 0x0100 != 0 {
                eprintln!("exectrace: command was killed by signal {}", status & 0xFF);
            } else if status != 0 {
                eprintln!("exectrace: command exited with code {}", status & 0xFF);
            }
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("exectrace: {}", err);
            std::process::exit(1);
        }
    }
}
