use docopt::Docopt;

use quire::consolidation::{
    ConsolidateAll, ConsolidateCount, ConsolidateDocsLive, ConsolidateTier, ConsolidationPolicy,
};
use quire::index_writer::{ConsolidationResult, IndexWriter, IndexWriterBuilder, OpenMode};
use quire::Error;
use tracing::info;

static USAGE: &'static str = concat!(
    "
Consolidates the segments of a quire index and commits the result.

Usage:
    quire force-merge [options]
    quire force-merge --help

Options:
    -p, --path <path>           Path of the index [default: .]
    --policy <policy>           Segments to merge: all, count, docs-live or tier [default: all]
    --threshold <t>             Threshold of the count and docs-live policies [default: 0.5]
    --min-segments <n>          Smallest tier the tier policy merges [default: 10]
    -v, --verbose               Log what is done
    -h, --help                  Show this message
"
);

#[derive(Deserialize)]
struct Args {
    flag_path: String,
    flag_policy: String,
    flag_threshold: f64,
    flag_min_segments: usize,
    flag_verbose: bool,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    super::init_logging(args.flag_verbose);

    let writer = super::open_writer(&args.flag_path, IndexWriterBuilder::new(), OpenMode::Append)?;
    let threshold = args.flag_threshold;
    let result = match args.flag_policy.as_str() {
        "all" => consolidate(&writer, ConsolidateAll)?,
        "count" => consolidate(&writer, ConsolidateCount { threshold })?,
        "docs-live" => consolidate(&writer, ConsolidateDocsLive { threshold })?,
        "tier" => consolidate(
            &writer,
            ConsolidateTier {
                ratio: threshold,
                min_segments: args.flag_min_segments,
            },
        )?,
        other => return Err(Error::illegal_state(format!("unknown policy '{}'", other))),
    };
    writer.commit()?;
    let state = writer.committed_state();
    info!(
        merged = result.size,
        status = ?result.status,
        segments = state.segments.len(),
        "consolidation done"
    );
    println!("{:?} {} {}", result.status, result.size, state.segments.len());
    Ok(())
}

fn consolidate<P>(writer: &IndexWriter, policy: P) -> Result<ConsolidationResult, Error>
where
    P: ConsolidationPolicy + 'static,
{
    writer.consolidate(policy, &mut || true)
}
