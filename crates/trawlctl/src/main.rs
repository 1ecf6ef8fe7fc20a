use anyhow::Context;
use clap::Parser;
use fetcher::{FetchPlan, FetchRunContext, Fetcher};

mod config;
mod recipes;

use config::{AppConfig, CredentialsKind, KvKind, StorageKind};

#[derive(Debug, Parser)]
#[command(
    name = "trawlctl",
    about = "Resumable multi-protocol data acquisition engine."
)]
struct Cli {
    #[clap(flatten)]
    log_args: cli_common::LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run a named acquisition configuration until its locators drain.
    Run(RunArgs),
    /// List the available configurations.
    Configs,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Name of the configuration to run.
    config_name: String,

    /// Credential backend, overriding TRAWLER_CREDENTIALS_TYPE.
    #[arg(long, value_enum)]
    credentials_provider: Option<CredentialsKind>,

    /// Storage backend, overriding TRAWLER_STORAGE_TYPE.
    #[arg(long, value_enum)]
    storage: Option<StorageKind>,

    /// Key-value backend, overriding TRAWLER_KV_TYPE.
    #[arg(long, value_enum)]
    kvstore: Option<KvKind>,

    /// Worker count, overriding TRAWLER_CONCURRENCY.
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli_common::init_logging(&cli.log_args);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Configs => {
            for name in recipes::CONFIG_NAMES {
                println!("{name}");
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut app = AppConfig::from_env().context("loading configuration from environment")?;
    if let Some(kind) = args.credentials_provider {
        app.credentials_kind = kind;
    }
    if let Some(kind) = args.storage {
        app.storage_kind = kind;
    }
    if let Some(kind) = args.kvstore {
        app.kv_kind = kind;
    }
    if let Some(concurrency) = args.concurrency {
        app.concurrency = concurrency;
    }

    let store = app.build_kv_store();
    let credentials = app.build_credential_provider();
    let sink = app
        .build_storage_sink()
        .await
        .context("building storage sink")?;

    let deps = recipes::RecipeDeps {
        config_name: args.config_name.clone(),
        store: store.clone(),
        credentials,
    };
    let recipe = recipes::build(&args.config_name, &deps)
        .with_context(|| format!("building configuration '{}'", args.config_name))?;

    let plan = FetchPlan::new(FetchRunContext::new(&app.run_id), app.concurrency);
    let result = Fetcher::new(recipe, sink).run(plan).await;

    tracing::info!(
        run_id = %result.context.run_id,
        processed_count = result.processed_count,
        error_count = result.errors.len(),
        "run finished"
    );
    for error in &result.errors {
        tracing::warn!(error, "request failed during run");
    }

    store.close().await.ok();
    Ok(())
}
