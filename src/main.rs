use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::info;

use oroshi::cache::ReductionCache;
use oroshi::engine::{self, ExecutionEngine};
use oroshi::storage::{S3Backend, StorageBackend};
use oroshi::store::BlobStore;
use oroshi::{Hash, Reductor};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Target thunk hashes to reduce
    #[arg(required = true)]
    targets: Vec<String>,

    /// Blob store root
    #[arg(long, default_value = oroshi::store::DEFAULT_ROOT)]
    store: Utf8PathBuf,

    /// Execution engine spec: 'local', 'local=N' or 'remote=HOST:PORT/N'.
    /// Repeatable; engines are tried in the given order.
    #[arg(long = "engine", default_value = "local")]
    engines: Vec<String>,

    /// Fallback engine spec, consulted only for thunks no primary engine
    /// admits. Repeatable.
    #[arg(long = "fallback")]
    fallbacks: Vec<String>,

    /// Base poller timeout in milliseconds. After a window with no
    /// completions, running jobs are duplicated. 0 disables duplication.
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Draw a single-line status bar while reducing
    #[arg(long)]
    status_bar: bool,

    /// S3 bucket for pre-staging inputs and fetching final outputs
    #[arg(long)]
    bucket: Option<String>,

    /// S3 region
    #[arg(long)]
    region: Option<String>,

    /// Custom S3-compatible endpoint URL
    #[arg(long)]
    endpoint: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    oroshi::init_logging().ok();

    let targets: Vec<Hash> = args
        .targets
        .iter()
        .map(|target| Hash::parse(target))
        .collect::<Result<_, _>>()
        .context("invalid target hash")?;

    let store = BlobStore::open(&args.store)
        .with_context(|| format!("couldn't open the blob store at '{}'", args.store))?;
    let cache = ReductionCache::new(store.clone());

    let engines: Vec<Box<dyn ExecutionEngine>> = args
        .engines
        .iter()
        .map(|spec| engine::from_spec(spec, &store, &cache))
        .collect::<Result<_, _>>()?;
    let fallbacks: Vec<Box<dyn ExecutionEngine>> = args
        .fallbacks
        .iter()
        .map(|spec| engine::from_spec(spec, &store, &cache))
        .collect::<Result<_, _>>()?;

    let storage: Option<Box<dyn StorageBackend>> = match args.bucket {
        Some(bucket) => Some(Box::new(S3Backend::new(
            bucket,
            args.region,
            args.endpoint,
        )?)),
        None => None,
    };

    let base_timeout = (args.timeout > 0).then(|| Duration::from_millis(args.timeout));

    let mut reductor = Reductor::new(
        targets,
        engines,
        fallbacks,
        storage,
        store,
        cache,
        base_timeout,
        args.status_bar,
    )?;

    reductor.upload_dependencies()?;
    let answers = reductor.reduce()?;
    reductor.download_targets(&answers)?;

    info!("reduced {} target(s)", answers.len());
    for answer in &answers {
        println!("{answer}");
    }

    Ok(())
}
