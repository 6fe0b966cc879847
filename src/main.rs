use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use annotation_sync::backend::{DirectoryBlobStore, DocumentStore, FeatureTarget, FlatFileStore};
use annotation_sync::broadcast::BroadcastHub;
use annotation_sync::config::ServerConfig;
use annotation_sync::service::ChangeService;
use annotation_sync::{api, db, ChangeError};

#[derive(Parser)]
#[command(name = "annotd")]
#[command(about = "Collaborative genome annotation server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the annotation server
    Serve {
        /// Port for HTTP API
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Apply pending database migrations and exit
    Migrate,
    /// Write the features of one reference sequence as GFF3
    Export {
        /// Reference sequence id
        #[arg(long)]
        ref_seq: Uuid,
        /// Output file
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the change log of an assembly
    Log {
        /// Assembly id
        #[arg(long)]
        assembly: Uuid,
        /// Only records after this channel sequence
        #[arg(long, default_value = "0")]
        since: i64,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "annotation_sync=debug,tower_http=debug".into()),
    );

    // Logs go to stderr so export and log output stay clean on stdout.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_database(config: &ServerConfig) -> anyhow::Result<db::Database> {
    let db = match &config.db_path {
        Some(path) => db::Database::open(path.clone())?,
        None => db::Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

async fn serve(config: ServerConfig, port: u16) -> anyhow::Result<()> {
    tracing::info!("Starting annotation server on port {}", port);

    let db = open_database(&config)?;
    let blobs = Arc::new(DirectoryBlobStore::new(config.file_dir.clone()));
    let hub = Arc::new(BroadcastHub::new(config.broadcast_capacity));
    let service = Arc::new(ChangeService::new(db, blobs, hub)?);

    let app = api::create_router_with_config(service, &config);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Annotation server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

fn export(config: &ServerConfig, ref_seq: Uuid, out: PathBuf) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let store = db.read(|store| {
        let ref_seq = store
            .find_ref_seq(ref_seq)?
            .ok_or_else(|| ChangeError::RefSeqNotFound(ref_seq.to_string()))?;
        let assembly = store
            .find_assembly(ref_seq.assembly)?
            .ok_or_else(|| ChangeError::AssemblyNotFound(ref_seq.assembly.to_string()))?;
        let features = store.find_features_in_range(ref_seq.id, 0, ref_seq.length)?;

        let mut flat_file = FlatFileStore::new(assembly);
        flat_file.add_ref_seq(ref_seq);
        for feature in &features {
            flat_file.add_top_level(feature)?;
        }
        Ok(flat_file)
    })?;
    store.save(&out)?;
    tracing::info!(path = %out.display(), features = store.features().len(), "exported GFF3");
    Ok(())
}

fn print_log(config: &ServerConfig, assembly: Uuid, since: i64) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let records = db.read(|store| store.find_changes_since(assembly, since))?;
    for record in records {
        println!(
            "{:>6} {:>6} {} {:<28} {}{}",
            record.sequence,
            record.channel_sequence,
            record.created_at.to_rfc3339(),
            record.type_name,
            record.user,
            record
                .reverts
                .map(|r| format!(" (reverts {})", r))
                .unwrap_or_default()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = ServerConfig::from_env();

    match cli.command {
        Some(Commands::Serve { port }) => serve(config, port).await?,
        Some(Commands::Migrate) => {
            open_database(&config)?;
            tracing::info!("Database is up to date");
        }
        Some(Commands::Export { ref_seq, out }) => export(&config, ref_seq, out)?,
        Some(Commands::Log { assembly, since }) => print_log(&config, assembly, since)?,
        None => serve(config, 3000).await?,
    }

    Ok(())
}
