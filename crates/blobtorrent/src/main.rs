mod args;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use blobtorrent_lib::{
    try_into, HttpBlobClient, PieceLayout, PieceStore, StoreConfig, TorrentDescriptor, DEFAULT_BLOCK_SIZE,
};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use crate::args::Arguments;

const TRACING_ENV: &str = "BLOBTORRENT_LOG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logger();

    let args = Arguments::parse();

    let descriptor = TorrentDescriptor::load(&args.torrent)
        .await
        .with_context(|| format!("failed to load the torrent from '{}'", args.torrent))?;
    tracing::info!(
        name = descriptor.name(),
        info_hash = %hex::encode(descriptor.info_hash()),
        pieces = descriptor.piece_hashes().len(),
        total_length = descriptor.total_length(),
        "loaded the torrent"
    );

    let client = HttpBlobClient::new(args.server.clone())?;
    let mut config = StoreConfig::default();
    if let Some(cache_limit) = args.cache_limit {
        config = config.with_max_cached_bytes(cache_limit);
    }
    let store = PieceStore::new(PieceLayout::new(&descriptor), Arc::new(client), config);

    let result = run(&store, args.output.as_deref()).await;
    store.close().await;

    result
}

#[tracing::instrument(level = "error", err(level = "debug"), skip_all)]
async fn run(store: &PieceStore, output: Option<&Path>) -> anyhow::Result<()> {
    let mut report = store.verify_all().await;
    if let Some(e) = report.batch_error.take() {
        return Err(e).context("failed to check which pieces the blob server has");
    }

    let missing = report.unverified_count();
    tracing::info!(
        available = report.verified_count(),
        missing,
        "checked the blob server for the torrent's pieces"
    );

    let Some(output) = output else {
        return Ok(());
    };

    if missing > 0 {
        anyhow::bail!("can't export the content, {missing} distinct pieces are missing from the blob server");
    }

    export(store, output).await
}

/// Writes the torrent's content to `output`, one block at a time
#[tracing::instrument(level = "error", err(level = "debug"), skip(store))]
async fn export(store: &PieceStore, output: &Path) -> anyhow::Result<()> {
    let layout = store.layout();
    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("failed to create {}", output.display()))?;

    let mut block = vec![0; DEFAULT_BLOCK_SIZE];
    let mut offset = 0u64;
    while offset < layout.total_length() {
        let address = layout.resolve(offset, 1)?;
        let left_in_piece = layout.piece_size(address.index)? - address.offset;
        let block_size = left_in_piece.min(DEFAULT_BLOCK_SIZE);

        store
            .read_at(&mut block[..block_size], offset)
            .await
            .with_context(|| format!("failed to read {block_size} bytes at offset {offset}"))?;
        file.write_all(&block[..block_size])
            .await
            .context("failed to write the content")?;

        offset += try_into!(block_size, u64)?;
    }

    file.flush().await.context("failed to flush the output file")?;
    tracing::info!(path = %output.display(), bytes = offset, "exported the content");

    Ok(())
}

fn setup_logger() {
    let env_filter = EnvFilter::builder()
        .with_env_var(TRACING_ENV)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt().compact().with_env_filter(env_filter).finish();

    tracing::subscriber::set_global_default(subscriber).expect("Error setting a global tracing::subscriber");
}
