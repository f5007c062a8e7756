use std::io;
use std::io::Write;

use docopt::Docopt;
use quire::{DefaultCodec, Error, FsDirectory, IndexReader};
use serde_json;

static USAGE: &'static str = concat!(
    "
Prints the committed state of a quire index as JSON, one line per segment after a line for
the index itself.

Usage:
    quire segments [options]
    quire segments --help

Options:
    -p, --path <path>           Path of the index [default: .]
    -h, --help                  Show this message
"
);

#[derive(Deserialize)]
struct Args {
    flag_path: String,
}

#[derive(Serialize)]
struct IndexInfo {
    generation: u64,
    segments: usize,
    docs: u64,
    live_docs: u64,
}

#[derive(Serialize)]
struct SegmentInfo<'a> {
    name: &'a str,
    version: u64,
    docs: u64,
    live_docs: u64,
    size: u64,
    files: Vec<&'a str>,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    let dir = FsDirectory::open(&args.flag_path)?;
    let reader = IndexReader::open(&dir, &DefaultCodec)?;
    let meta = reader.meta();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let index = IndexInfo {
        generation: meta.generation,
        segments: meta.segments.len(),
        docs: meta.docs_count(),
        live_docs: meta.live_docs_count(),
    };
    serde_json::to_writer(&mut out, &index).map_err(|e| Error::Other(Box::new(e)))?;
    writeln!(out)?;
    for segment in &meta.segments {
        let info = SegmentInfo {
            name: &segment.meta.name,
            version: segment.meta.version,
            docs: segment.meta.docs_count,
            live_docs: segment.meta.live_docs_count,
            size: segment.meta.size,
            files: segment.files().map(|f| f.as_str()).collect(),
        };
        serde_json::to_writer(&mut out, &info).map_err(|e| Error::Other(Box::new(e)))?;
        writeln!(out)?;
    }
    Ok(())
}
