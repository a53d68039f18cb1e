use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Arg, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tubedex::config::Config;
use tubedex::index::{IndexOutcome, Indexer};
use tubedex::pipeline::Pipeline;
use tubedex::store::Store;
use tubedex::youtube;
use tubedex::{scheduler, server, stem};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("tubedex=info,warn")
        .init();

    let matches = Command::new("tubedex")
        .version("0.1.0")
        .about("Transcript indexing and stem-tolerant search for YouTube channels")
        .subcommand(
            Command::new("index")
                .about("Index a channel's uploads playlist")
                .arg(
                    Arg::new("channel")
                        .value_name("CHANNEL_ID")
                        .help("Channel to index")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("failures")
                .about("Drain the no-captions failure queue with local transcription"),
        )
        .subcommand(
            Command::new("stem")
                .about("Print the stemmed form of a line")
                .arg(Arg::new("text").value_name("TEXT").required(true)),
        )
        .subcommand(Command::new("serve").about("Serve search and keep channels up to date"))
        .get_matches();

    // Needs no configuration, network or database.
    if let Some(sub) = matches.subcommand_matches("stem") {
        println!("{}", stem::stem_line(sub.get_one::<String>("text").unwrap()));
        return Ok(());
    }

    let config = Config::load()?;
    config.validate()?;

    let store = Store::open(&config.database.path).await?;
    let platform: Arc<dyn youtube::Platform> =
        Arc::new(youtube::Client::new(config.youtube.api_key.clone()));
    let indexer = Indexer::new(store.clone(), Arc::clone(&platform));

    match matches.subcommand() {
        Some(("index", sub)) => {
            let id = sub.get_one::<String>("channel").unwrap();
            let channel = indexer.ensure_channel(id).await?;
            info!("🚀 indexing channel {:?}", channel.title);

            match indexer.index_channel(&channel).await? {
                IndexOutcome::Completed => info!("✅ finished indexing {:?}", channel.title),
                IndexOutcome::CaughtUp => info!("✅ caught up with {:?}", channel.title),
                IndexOutcome::QuotaExhausted => {
                    warn!("⏸  quota exhausted, the page to resume from is in the failures queue")
                }
            }
        }
        Some(("failures", _)) => {
            let pipeline = Pipeline::new(
                store,
                platform,
                config.whisper.clone(),
                config.tools.clone(),
            );
            pipeline.run().await?;
        }
        _ => {
            // Default: serve search with periodic catch-up indexing.
            let cancel = CancellationToken::new();

            let scheduler_task = tokio::spawn(scheduler::run(
                indexer.clone(),
                store.clone(),
                Duration::from_secs(config.server.check_interval_secs),
                cancel.clone(),
            ));

            let interrupt_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    interrupt_cancel.cancel();
                }
            });

            server::serve(store, indexer, &config.server, cancel.clone()).await?;

            cancel.cancel();
            let _ = scheduler_task.await;
        }
    }

    Ok(())
}
