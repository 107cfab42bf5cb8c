use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use wikimigrate_core::config::{self, DEFAULT_CONFIG_FILE, DEFAULT_EXPORT_DIR};
use wikimigrate_core::export::{ExportOptions, run_export};
use wikimigrate_core::import::{ImportOptions, ImportSession};
use wikimigrate_core::log::{MIGRATION_FAILURES_FILE, MIGRATION_LOG_FILE};
use wikimigrate_core::outline::{
    DEFAULT_COLLECTION_DESCRIPTION, DEFAULT_COLLECTION_NAME, OutlineClient,
};

/// Migrate a Wiki.js wiki into Outline.
#[derive(Parser)]
#[command(name = "wikimigrate", version, about)]
struct Cli {
    /// Config file path
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export all pages and assets from a Wiki.js instance
    Export(ExportArgs),
    /// Import an exported wiki tree into an Outline collection
    Import(ImportArgs),
}

#[derive(clap::Args)]
struct ExportArgs {
    /// Wiki.js base URL
    #[arg(long)]
    wiki_url: Option<String>,

    /// Wiki.js API token
    #[arg(long)]
    token: Option<String>,

    /// Directory to write the export into
    #[arg(long, default_value = DEFAULT_EXPORT_DIR)]
    output_dir: PathBuf,

    /// Skip pages and only download assets
    #[arg(long)]
    assets_only: bool,
}

#[derive(clap::Args)]
struct ImportArgs {
    /// Outline base URL
    #[arg(long)]
    outline_url: Option<String>,

    /// Outline API token
    #[arg(long)]
    token: Option<String>,

    /// Directory holding the exported wiki tree
    wiki_dir: PathBuf,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = config::load_config(&config_path)?;

    match cli.command {
        Commands::Export(args) => {
            let options = ExportOptions {
                wiki_url: config.wikijs_url(args.wiki_url)?,
                token: config.wikijs_token(args.token)?,
                output_dir: args.output_dir,
                assets_only: args.assets_only,
                page_throttle: config.limits().page_throttle,
            };
            run_export(options)
        }
        Commands::Import(args) => {
            let url = config.outline_url(args.outline_url)?;
            let token = config.outline_token(args.token)?;
            let limits = config.limits();

            let mut client = OutlineClient::new(&url, &token)?;
            client.ensure_collection(DEFAULT_COLLECTION_NAME, DEFAULT_COLLECTION_DESCRIPTION)?;
            client.permission_self_test()?;

            let wiki_dir = args.wiki_dir;
            let session = ImportSession::new(
                &client,
                ImportOptions {
                    wiki_dir: wiki_dir.clone(),
                    max_upload_bytes: limits.max_upload_bytes,
                    document_throttle: limits.document_throttle,
                },
            );
            let summary = session.run()?;

            println!("\nImport finished");
            println!("  documents created:    {}", summary.documents_created);
            println!("  documents failed:     {}", summary.documents_failed);
            println!("  placeholders created: {}", summary.placeholders_created);
            println!("  moves failed:         {}", summary.moves_failed);
            println!("  crosslinks rewritten: {}", summary.crosslinks_rewritten);
            println!(
                "Reports: {} and {}",
                wiki_dir.join(MIGRATION_LOG_FILE).display(),
                wiki_dir.join(MIGRATION_FAILURES_FILE).display()
            );
            Ok(())
        }
    }
}
