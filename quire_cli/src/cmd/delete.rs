use docopt::Docopt;

use quire::analyzis::Analyzer;
use quire::filter::TermFilter;
use quire::index_writer::{IndexWriterBuilder, OpenMode};
use quire::Error;
use tracing::info;

static USAGE: &'static str = concat!(
    "
Removes the documents of a quire index which contain a term.

Usage:
    quire delete <field> <term> [options]
    quire delete --help

Options:
    -p, --path <path>           Path of the index [default: .]
    -a, --analyzer <analyzer>   Analyzer to tokenize the term with: uax29, whitespace or noop.
                                Documents containing any token are removed. [default: noop]
    -v, --verbose               Log what is done
    -h, --help                  Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_field: String,
    arg_term: String,
    flag_path: String,
    flag_analyzer: String,
    flag_verbose: bool,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    super::init_logging(args.flag_verbose);
    let analyzer = match <dyn Analyzer>::for_name(&args.flag_analyzer) {
        Some(analyzer) => analyzer,
        None => {
            return Err(Error::illegal_state(format!(
                "unknown analyzer '{}'",
                args.flag_analyzer
            )))
        }
    };

    let writer = super::open_writer(&args.flag_path, IndexWriterBuilder::new(), OpenMode::Append)?;
    let before = writer.committed_state().live_docs_count();
    {
        let mut docs = writer.documents();
        for token in analyzer.analyze(&args.arg_term) {
            docs.remove(TermFilter::new(args.arg_field.as_str(), &*token));
        }
    }
    writer.commit()?;
    let after = writer.committed_state().live_docs_count();
    info!(removed = before - after, live = after, "deleted documents");
    println!("{}", before - after);
    Ok(())
}
