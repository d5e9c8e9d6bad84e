use std::{sync::Arc, time::Duration};

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod agent;
mod cli;
mod config;
mod llm;
mod pipeline;
mod retrieval;
mod scrape;
#[cfg(test)]
mod tests;
mod web;

use config::Config;
use pipeline::{PipelineServices, StateMachine};
use retrieval::{Embedder, FastEmbedder, IndexLifecycle, IndexPaths, RetrievalService};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("querybot=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn retrieval_service(config: &Config) -> anyhow::Result<RetrievalService> {
    let embedder: Arc<dyn Embedder> = Arc::new(FastEmbedder::new(
        &config.retrieval.model,
        config.base_path().to_path_buf(),
        Some(Duration::from_secs(config.retrieval.download_timeout_secs)),
    )?);

    let lifecycle = IndexLifecycle::new(
        config.source_dir(),
        IndexPaths::new(config.documents_path(), config.vectors_path()),
        config.retrieval.chunk_size,
        config.retrieval.chunk_overlap,
        embedder.clone(),
    );

    Ok(RetrievalService::new(embedder, lifecycle))
}

fn pipeline_services(config: Config) -> anyhow::Result<PipelineServices> {
    let retrieval = retrieval_service(&config)?;
    // a missing or broken index degrades retrieval, it does not stop the bot
    if let Err(err) = retrieval.initialize() {
        log::error!("vector index unavailable: {err}");
    }

    let llm = Arc::new(llm::ChatClient::from_config(&config.llm)?);
    let launcher = agent::default_launcher(&config.agent);

    Ok(PipelineServices {
        retrieval: Arc::new(retrieval),
        llm,
        launcher,
        config: Arc::new(config),
    })
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();
    let config = Config::load()?;

    match args.command {
        cli::Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let services = pipeline_services(config)?;
            web::start_daemon(services, listen)
        }

        cli::Command::Ask { question } => {
            let services = pipeline_services(config)?;
            let ctx = StateMachine::default().run(&services, &question, |event| {
                print!("{}", web::frame(&event.to_json()));
            });
            print!("{}", web::end_frame());

            if let Some(response) = ctx.response {
                eprintln!("\n{response}");
            }
            Ok(())
        }

        cli::Command::Index { force } => {
            let retrieval = retrieval_service(&config)?;
            let outcome = if force {
                retrieval.rebuild()?
            } else {
                retrieval.initialize()?
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }

        cli::Command::Search { query, k } => {
            let retrieval = retrieval_service(&config)?;
            retrieval.initialize()?;
            let results = retrieval.search(&query, k);
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
    }
}
