// po_ingestor/src/main.rs
// Entry point for the po_ingestor CLI application.

use std::path::Path;

use clap::Parser;
use po_ingestor::cli::{Cli, Commands, ExploreArgs, QueryArgs};
use po_ingestor::config::LoaderConfig;
use po_ingestor::error::{LoaderError, Result};
use po_ingestor::loader::Loader;
use po_ingestor::mongo::MongoStore;
use po_ingestor::query::{
    self, QueryExecutor, parse_filter, parse_pipeline, spending_by_fiscal_year,
};
use po_ingestor::{schema, stats};
use serde_json::json;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(),> {
    // Initialize tracing
    let file_appender = tracing_appender::rolling::never(".", "po_ingestor.log",);
    let (non_blocking, _guard,) = tracing_appender::non_blocking(file_appender,);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info",),),)
        .with(fmt::layer().with_writer(std::io::stderr,),)
        .with(fmt::layer().with_writer(non_blocking,).with_ansi(false,),)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Load(args,) => {
            let mut config = args.store.to_config();
            config.chunk_size = args.chunk_size;
            let store = MongoStore::connect(&config,).await?;

            let loader = Loader::new(&store, &config,);
            let report = loader.load_csv(&args.path, args.max_records,).await?;
            if cli.report {
                report.save(Path::new("load_report.json",),)?;
            }
            print_json(&report,)?;

            // Post-load verification, mirroring what the report claims.
            let verification = stats::collect(&store, 3,).await?;
            info!(
                "Verified {} documents in '{}'",
                verification.total_documents, config.collection
            );
            store.shutdown().await;
        },
        Commands::Verify(args,) | Commands::Stats(args,) => {
            let config = args.store.to_config();
            let store = MongoStore::connect(&config,).await?;
            let collected = stats::collect(&store, args.samples,).await?;
            print_json(&collected,)?;
            store.shutdown().await;
        },
        Commands::Schema(args,) => {
            let config = args.store.to_config();
            let store = MongoStore::connect(&config,).await?;
            let report = schema::introspect(&store, args.sample_size,).await?;
            print_json(&report,)?;
            store.shutdown().await;
        },
        Commands::Explore(args,) => {
            let config = args.store.to_config();
            let store = MongoStore::connect(&config,).await?;
            run_explore(&store, &config, args,).await?;
            store.shutdown().await;
        },
        Commands::Query(args,) => {
            let config = args.store.to_config();
            let store = MongoStore::connect(&config,).await?;
            run_query(&store, &config, args,).await?;
            store.shutdown().await;
        },
    }

    Ok((),)
}

async fn run_explore(store: &MongoStore, config: &LoaderConfig, args: &ExploreArgs,) -> Result<(),> {
    let executor = QueryExecutor::new(store, config,);
    let floor = config.spend_floor;

    let overview = stats::overview(store, config,).await?;
    let by_fiscal_year = executor.aggregate(spending_by_fiscal_year(floor,),).await?;
    let departments = executor
        .aggregate(query::top_departments(args.top_n, floor,),)
        .await?;
    let suppliers = executor
        .aggregate(query::top_suppliers(args.top_n, floor,),)
        .await?;
    let items = executor
        .aggregate(query::top_items(args.top_n, floor,),)
        .await?;
    let methods = executor
        .aggregate(query::acquisition_methods(floor,),)
        .await?;

    print_json(&json!({
        "overview": overview,
        "spending_by_fiscal_year": by_fiscal_year,
        "top_departments": departments,
        "top_suppliers": suppliers,
        "top_items": items,
        "acquisition_methods": methods,
    }),)
}

async fn run_query(store: &MongoStore, config: &LoaderConfig, args: &QueryArgs,) -> Result<(),> {
    let executor = QueryExecutor::new(store, config,);
    let output = match (&args.filter, &args.pipeline,) {
        (Some(raw,), None,) => {
            let filter = parse_filter(raw,)?;
            executor.find(filter, args.limit,).await?
        },
        (None, Some(raw,),) => {
            let pipeline = parse_pipeline(raw,)?;
            executor.aggregate(pipeline,).await?
        },
        _ => {
            return Err(LoaderError::Configuration(
                "provide exactly one of --filter or --pipeline".to_string(),
            ),);
        },
    };
    print_json(&output,)
}

fn print_json<T: serde::Serialize,>(value: &T,) -> Result<(),> {
    let rendered = serde_json::to_string_pretty(value,)
        .map_err(|e| LoaderError::Other(format!("Failed to render output: {}", e),),)?;
    println!("{}", rendered);
    Ok((),)
}
