use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use koreader_sync::config::{Cli, Config, StoreSettings, default_config_path};
use koreader_sync::progress::LogProgress;
use koreader_sync::run::{Syncer, failure_notice};
use koreader_sync::source::DirectorySource;
use koreader_sync::store::BlockStore;
use koreader_sync::store::file::FileStore;
use koreader_sync::store::logseq::LogseqApi;
use koreader_sync::unpack_error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

async fn open_store(settings: &StoreSettings) -> anyhow::Result<Arc<dyn BlockStore>> {
    match settings {
        StoreSettings::File { path } => {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            Ok(Arc::new(FileStore::open(path).await?))
        }
        StoreSettings::Logseq { api_url, api_token } => {
            Ok(Arc::new(LogseqApi::new(api_url.clone(), api_token.clone())))
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("koreader-sync starting");

    let config_path = args
        .config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let mut cfg = Config::new_or_default(&config_path.to_string_lossy()).unwrap_or_else(|e| {
        tracing::error!(error = %e, path = ?config_path, "failed to load config file");
        std::process::exit(1);
    });
    if let Some(dir) = args.metadata_dir {
        cfg.sync.metadata_dir = Some(PathBuf::from(dir));
    }
    if let Some(page) = args.page {
        cfg.sync.page = page;
    }

    let Some(metadata_dir) = cfg.sync.metadata_dir.clone() else {
        tracing::error!("no KOReader directory configured, pass --dir or set sync.metadata_dir");
        std::process::exit(2);
    };

    let store = open_store(&cfg.store).await.unwrap_or_else(|e| {
        tracing::error!(error = ?e, "failed to open block store");
        std::process::exit(1);
    });

    let syncer = Syncer::new(store, cfg.sync.page.clone(), cfg.sync.projection());
    let source = DirectorySource::new(metadata_dir);
    let cancellation_token = CancellationToken::new();
    let mut progress = LogProgress::new();

    let run = syncer.run(&source, &mut progress, &cancellation_token);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = signal::ctrl_c() => {
            tracing::info!("ctrl+c signal received, finishing current book");
            cancellation_token.cancel();
            run.await
        }
    };

    match result {
        Ok(report) => {
            println!("{}", report.notice());
            if report.has_errors() {
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!(error = %unpack_error(&e), untouched = e.is_pre_mutation(), "sync failed");
            eprintln!("{}", failure_notice(&e));
            std::process::exit(1);
        }
    }
    tracing::info!("koreader-sync done");
}
