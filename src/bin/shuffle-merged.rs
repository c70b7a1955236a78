//! Demo harness driving one partition's sort-merge against files on disk.
//!
//! Not part of the scoped engine (spec §1 lists CLI/config/logging as
//! external collaborators); this binary exists to exercise the library end
//! to end and as a smoke test, the way a real embedding inside a shuffle
//! server process would wire the same pieces together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use shuffle_merge::collaborators::testing::{AlwaysGrantTaskManager, InMemoryBufferManager, InMemoryStorageManager, InlineEventHandler};
use shuffle_merge::collaborators::MergeEvent;
use shuffle_merge::codec::{LengthPrefixedSerializer, RawByteComparator};
use shuffle_merge::index::parse_index_records;
use shuffle_merge::{MergeConfig, Partition};

#[derive(Parser, Debug)]
#[command(name = "shuffle-merged", about = "Run one partition's sort-merge against on-disk blocks")]
struct Args {
    /// Directory containing the partition's data file.
    #[arg(long, value_name = "DIR")]
    data_dir: PathBuf,

    /// Path to the sidecar index file (40-byte records, spec §6).
    #[arg(long, value_name = "FILE")]
    index_file: PathBuf,

    /// Optional TOML config file; falls back to built-in defaults.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "demo-app")]
    app_id: String,

    #[arg(long, default_value_t = 0)]
    shuffle_id: u32,

    #[arg(long, default_value_t = 0)]
    partition_id: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            MergeConfig::from_toml_str(&text)?
        }
        None => MergeConfig::default(),
    };

    let data_path = args.data_dir.join("shuffle.data");
    let index_bytes = tokio::fs::read(&args.index_file).await?;
    let expected_block_ids: Vec<u64> = parse_index_records(&index_bytes)?
        .into_iter()
        .map(|entry| entry.block_id)
        .collect();

    let storage = Arc::new(InMemoryStorageManager::new());
    storage.set_input_paths(&args.app_id, args.shuffle_id, args.partition_id, data_path, args.index_file.clone());

    let partition_slot: Arc<Mutex<Option<Arc<Partition>>>> = Arc::new(Mutex::new(None));
    let partition_slot_for_handler = Arc::clone(&partition_slot);
    let event_handler = Arc::new(InlineEventHandler::new(move |event: MergeEvent| {
        let partition = partition_slot_for_handler
            .lock()
            .clone()
            .expect("partition registered before any merge event fires");
        tokio::spawn(partition.run_merge(event.expected_block_ids));
    }));

    let partition = Partition::new(
        args.app_id.clone(),
        args.shuffle_id,
        args.partition_id,
        config,
        Arc::new(InMemoryBufferManager::new()),
        Arc::new(AlwaysGrantTaskManager),
        storage,
        event_handler,
        Arc::new(RawByteComparator),
        Arc::new(LengthPrefixedSerializer),
    );
    *partition_slot.lock() = Some(Arc::clone(&partition));

    tracing::info!(blocks = expected_block_ids.len(), "starting sort-merge");
    partition.start_sort_merge(expected_block_ids);

    loop {
        if partition.state().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut merged_block_count = 0usize;
    while partition.merged_result().size(merged_block_count as u64).is_some() {
        merged_block_count += 1;
    }

    println!("partition state: {}", partition.state());
    println!("merged block count: {merged_block_count}");

    if partition.state() == shuffle_merge::MergeState::InternalError {
        anyhow::bail!("merge ended in INTERNAL_ERROR");
    }

    Ok(())
}
