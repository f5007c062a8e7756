use std::io;
use std::io::BufReader;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use docopt::Docopt;
use quire::doc::text_fields;
use quire::filter::TermFilter;
use quire::index_writer::{IndexWriter, IndexWriterBuilder, OpenMode};
use quire::{Doc, Error, Field};
use serde_json;
use threadpool::ThreadPool;
use tracing::info;

static USAGE: &'static str = concat!(
    "
Index JSON documents read from standard input into a quire index. Every document is an object
of string values, each of them indexed as full text and stored.

Usage:
    quire index [options]
    quire index --help

Options:
    -p, --path <path>           Path to index to [default: .]
    -i, --id <field>            Field identifying a document. A document replaces those with
                                the same id.
    -t, --threads <n>           Indexing threads [default: 4]
    -b, --batch <n>             Documents per batch [default: 1000]
    --commit-every <n>          Documents between commits, 0 to commit once [default: 0]
    --segment-docs-max <n>      Documents per segment, 0 for no limit [default: 0]
    -c, --create                Replace an existing index
    -v, --verbose               Log progress
    -h, --help                  Show this message
"
);

#[derive(Deserialize)]
struct Args {
    flag_path: String,
    flag_id: Option<String>,
    flag_threads: usize,
    flag_batch: usize,
    flag_commit_every: usize,
    flag_segment_docs_max: usize,
    flag_create: bool,
    flag_verbose: bool,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    super::init_logging(args.flag_verbose);
    let mode = if args.flag_create {
        OpenMode::Create
    } else {
        OpenMode::CreateOrAppend
    };
    let builder = IndexWriterBuilder::new().segment_docs_max(args.flag_segment_docs_max);
    let writer = Arc::new(super::open_writer(&args.flag_path, builder, mode)?);
    let id_field = Arc::new(args.flag_id);
    let batch_size = args.flag_batch.max(1);

    let (sender, receiver) = mpsc::sync_channel(batch_size * 4);
    thread::spawn(move || {
        let stream =
            serde_json::Deserializer::from_reader(BufReader::new(io::stdin())).into_iter::<Doc>();
        for doc in stream {
            if sender.send(doc).is_err() {
                break;
            }
        }
    });

    let pool = ThreadPool::new(args.flag_threads.max(1));
    let (done, results) = mpsc::channel();
    let started = Instant::now();
    let mut read = 0;
    let mut since_commit = 0;
    let mut batch = Vec::with_capacity(batch_size);
    for doc in receiver {
        batch.push(doc.map_err(|e| Error::Other(Box::new(e)))?);
        read += 1;
        since_commit += 1;
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            submit(&pool, &writer, &id_field, full, &done);
        }
        if args.flag_commit_every > 0 && since_commit >= args.flag_commit_every {
            writer.commit()?;
            since_commit = 0;
            info!(
                read,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "committed"
            );
        }
    }
    if !batch.is_empty() {
        submit(&pool, &writer, &id_field, batch, &done);
    }
    drop(done);
    pool.join();

    let mut indexed = 0;
    for result in results {
        indexed += result?;
    }
    writer.commit()?;
    let elapsed = started.elapsed();
    info!(
        indexed,
        elapsed_ms = elapsed.as_millis() as u64,
        docs_per_sec = (indexed as f64 / elapsed.as_secs_f64().max(0.001)) as u64,
        generation = writer.generation(),
        "indexing done"
    );
    Ok(())
}

fn submit(
    pool: &ThreadPool,
    writer: &Arc<IndexWriter>,
    id_field: &Arc<Option<String>>,
    batch: Vec<Doc>,
    done: &mpsc::Sender<Result<usize, Error>>,
) {
    let writer = writer.clone();
    let id_field = id_field.clone();
    let done = done.clone();
    pool.execute(move || {
        let result = index_batch(&writer, id_field.as_deref(), batch);
        let _ = done.send(result);
    });
}

fn index_batch(
    writer: &IndexWriter,
    id_field: Option<&str>,
    batch: Vec<Doc>,
) -> Result<usize, Error> {
    let mut docs = writer.documents();
    let mut indexed = 0;
    for doc in batch {
        if let Some(name) = id_field {
            if let Some(id) = doc.get(name) {
                docs.remove(TermFilter::new(name, id.as_str()));
            }
        }
        let inserted = docs.insert(|d| {
            for field in text_fields(&doc) {
                let field = match id_field {
                    Some(name) if name == field.name => {
                        Field::string(field.name.clone(), field.value.as_str())
                    }
                    _ => field,
                };
                d.index(&field)?;
                d.store(&field)?;
            }
            Ok(true)
        })?;
        if inserted {
            indexed += 1;
        }
    }
    Ok(indexed)
}
