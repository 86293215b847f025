use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result, bail};
use paysettle::application::orchestrator::{ChargeOrchestrator, Collaborators};
use paysettle::config::{AbandonedPolicy, ProcessorKind, Settings};
use paysettle::domain::clock::SystemClock;
use paysettle::domain::ports::{InvoiceFilter, ProcessorOutcome, SharedProcessor};
use paysettle::infrastructure::Stores;
use paysettle::infrastructure::processors::paystack::DEFAULT_BASE_URL;
use paysettle::infrastructure::processors::{
    PaystackProcessor, ResilientProcessor, RetryConfig, SandboxProcessor,
};
use paysettle::infrastructure::reference::RandomReferenceGenerator;
use paysettle::interfaces::csv::{CustomerReader, InvoiceWriter};
use paysettle::interfaces::http;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `paysettle=debug`
    #[arg(long, env = "PAYSETTLE_LOG", default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP settlement service
    Serve(ServeArgs),
    /// Load customers (and stored cards) from a CSV file into the store
    ImportCustomers {
        /// CSV with header `id,email,first_name,last_name,card_token`
        input: PathBuf,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Write invoices as CSV to stdout
    ExportInvoices {
        #[command(flatten)]
        storage: StorageArgs,
        /// Only this customer's invoices
        #[arg(long)]
        customer: Option<Uuid>,
    },
}

#[derive(Args)]
struct StorageArgs {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "PAYSETTLE_DB_PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "PAYSETTLE_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    #[command(flatten)]
    storage: StorageArgs,

    #[arg(long, env = "PAYSETTLE_PROCESSOR", value_enum, default_value_t = ProcessorKind::Sandbox)]
    processor: ProcessorKind,

    #[arg(long, env = "PAYSTACK_SECRET_KEY", hide_env_values = true)]
    paystack_secret_key: Option<String>,

    #[arg(long, env = "PAYSTACK_BASE_URL", default_value = DEFAULT_BASE_URL)]
    paystack_base_url: String,

    /// Lifetime of an invoice issued without an explicit expiry
    #[arg(long, default_value_t = 24)]
    invoice_ttl_hours: u32,

    #[arg(long, default_value_t = 15)]
    processor_timeout_secs: u64,

    /// Extra attempts for retry-safe processor calls
    #[arg(long, default_value_t = 2)]
    processor_retries: u32,

    /// Attempts at marking an invoice paid after its transaction settled
    #[arg(long, default_value_t = 5)]
    settle_write_retries: u32,

    #[arg(long, value_enum, default_value_t = AbandonedPolicy::Terminal)]
    abandoned_policy: AbandonedPolicy,

    /// Customers CSV to preload before serving
    #[arg(long)]
    customers: Option<PathBuf>,
}

impl ServeArgs {
    fn settings(&self) -> Settings {
        Settings {
            invoice_ttl: chrono::Duration::hours(i64::from(self.invoice_ttl_hours)),
            abandoned_policy: self.abandoned_policy,
            processor_timeout: Duration::from_secs(self.processor_timeout_secs),
            processor_retries: self.processor_retries,
            settle_write_retries: self.settle_write_retries,
            ..Settings::default()
        }
    }

    fn processor(&self, settings: &Settings) -> Result<SharedProcessor> {
        let retry = RetryConfig::from(settings);
        let processor: SharedProcessor = match self.processor {
            // Local runs settle every attempt on its first verification.
            ProcessorKind::Sandbox => Arc::new(ResilientProcessor::new(
                SandboxProcessor::new().with_default_outcome(ProcessorOutcome::Success),
                retry,
            )),
            ProcessorKind::Paystack => {
                let Some(key) = self.paystack_secret_key.as_deref() else {
                    bail!("--paystack-secret-key (or PAYSTACK_SECRET_KEY) is required for the paystack processor");
                };
                let paystack =
                    PaystackProcessor::new(key, self.paystack_base_url.as_str()).into_diagnostic()?;
                Arc::new(ResilientProcessor::new(paystack, retry))
            }
        };
        Ok(processor)
    }
}

fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => Ok(Stores::rocksdb(path)?),
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(Stores::in_memory())
        }
        None => Ok(Stores::in_memory()),
    }
}

/// Upserts every readable row; unreadable rows are logged and skipped.
async fn import_customers(stores: &Stores, input: &Path) -> Result<usize> {
    let file = File::open(input).into_diagnostic()?;
    let mut imported = 0;
    for record in CustomerReader::new(file).customers() {
        match record {
            Ok(record) => {
                stores.customers.upsert_customer(record.customer).await?;
                if let Some(card) = record.card {
                    stores.customers.upsert_card(card).await?;
                }
                imported += 1;
            }
            Err(e) => warn!(error = %e, "skipping customer row"),
        }
    }
    Ok(imported)
}

fn orchestrator(stores: Stores, processor: SharedProcessor, settings: &Settings) -> ChargeOrchestrator {
    ChargeOrchestrator::new(
        Collaborators {
            invoices: stores.invoices,
            transactions: stores.transactions,
            customers: stores.customers,
            processor,
            references: Arc::new(RandomReferenceGenerator),
            clock: Arc::new(SystemClock),
        },
        settings,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Command::Serve(args) => {
            let settings = args.settings();
            let stores = open_stores(args.storage.db_path.as_deref())?;
            if let Some(path) = &args.customers {
                let imported = import_customers(&stores, path).await?;
                info!(imported, "customers preloaded");
            }
            let processor = args.processor(&settings)?;
            info!(processor = processor.name(), "processor configured");

            let orchestrator = Arc::new(orchestrator(stores, processor, &settings));
            let listener = tokio::net::TcpListener::bind(args.bind)
                .await
                .into_diagnostic()?;
            http::serve(listener, http::router(orchestrator))
                .await
                .into_diagnostic()?;
        }
        Command::ImportCustomers { input, storage } => {
            let stores = open_stores(storage.db_path.as_deref())?;
            let imported = import_customers(&stores, &input).await?;
            info!(imported, "customers imported");
        }
        Command::ExportInvoices { storage, customer } => {
            let stores = open_stores(storage.db_path.as_deref())?;
            // Exports never reach a processor.
            let processor: SharedProcessor = Arc::new(SandboxProcessor::new());
            let orchestrator = orchestrator(stores, processor, &Settings::default());
            let filter = customer.map_or(InvoiceFilter::All, InvoiceFilter::Customer);
            let invoices = orchestrator.invoices(&filter).await?;

            let stdout = io::stdout();
            let mut writer = InvoiceWriter::new(stdout.lock());
            writer.write_invoices(&invoices)?;
        }
    }

    Ok(())
}
