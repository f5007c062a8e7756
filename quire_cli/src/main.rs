extern crate docopt;
extern crate quire;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate threadpool;
extern crate tracing;
extern crate tracing_subscriber;

use std::env;
use std::process;

use docopt::Docopt;

mod cmd;

static USAGE: &'static str = "
Maintains a quire index.

Usage:
    quire <command> [<args>...]
    quire --help

Commands:
    index          Index JSON documents read from standard input
    delete         Remove documents containing a term
    force-merge    Consolidate segments
    segments       Print the segments of the committed index

Options:
    -h, --help     Show this message

See 'quire <command> --help' for the options of a command.
";

#[derive(Deserialize)]
struct Args {
    arg_command: String,
}

fn main() {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.options_first(true).deserialize())
        .unwrap_or_else(|e| e.exit());
    let argv: Vec<String> = env::args().collect();
    let argv: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    let result = match args.arg_command.as_str() {
        "index" => cmd::index::run(&argv),
        "delete" => cmd::delete::run(&argv),
        "force-merge" => cmd::force_merge::run(&argv),
        "segments" => cmd::segments::run(&argv),
        other => {
            eprintln!("Unknown command '{}'.{}", other, USAGE);
            process::exit(1);
        }
    };
    if let Err(e) = result {
        eprintln!("quire: {}", e);
        process::exit(1);
    }
}
