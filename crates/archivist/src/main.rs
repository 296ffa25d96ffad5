//! archivist - chunked archival CLI
//!
//! Subcommands:
//! - `archivist push <file>` - Chunk, upload and journal a file
//! - `archivist pull <archive_id>` - Download, verify and reassemble an archive
//! - `archivist build-index` - Rebuild latest.json and by_tag/ from the manifest
//! - `archivist list` - Show journaled archives, newest first
//! - `archivist extract <bundle> <dest>` - Safely unpack a tar or tar.gz bundle

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "archivist")]
#[command(about = "Chunked, verified archival of large artifacts to a blob backend")]
#[command(version)]
struct Cli {
    /// TOML config file with an [archive] section (environment is used otherwise)
    #[arg(short, long, global = true, env = "ARCHIVIST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive a local file
    Push {
        /// File to archive
        file: PathBuf,

        /// Tags (comma-separated or repeated)
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Free-form note stored with the entry
        #[arg(long, default_value = "")]
        note: String,

        /// Override the configured maximum chunk size
        #[arg(long)]
        chunk_size_bytes: Option<u64>,

        /// Use this archive id instead of allocating one
        #[arg(long)]
        archive_id: Option<String>,

        /// Report the plan without uploading or journaling
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore an archived file
    Pull {
        /// Archive id (A-YYYY-MM-DD-####)
        archive_id: String,

        /// Directory to write the restored file into
        #[arg(long, default_value = ".")]
        outdir: PathBuf,

        /// Report what would be fetched without downloading
        #[arg(long)]
        dry_run: bool,

        /// Unpack the restored bundle into this directory after verification
        #[arg(long)]
        extract: Option<PathBuf>,
    },

    /// Rebuild the derived index from the manifest
    BuildIndex {
        /// Entries kept in latest.json
        #[arg(long)]
        latest_n: Option<usize>,

        /// Print the files that would be written
        #[arg(long)]
        dry_run: bool,
    },

    /// List journaled archives, newest first
    List {
        /// Only entries carrying this exact tag
        #[arg(long)]
        tag: Option<String>,

        /// Case-insensitive match on id, name, note and tags
        #[arg(long)]
        query: Option<String>,

        /// Maximum number of entries shown
        #[arg(long)]
        limit: Option<usize>,

        /// Print entries as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Safely unpack a tar or tar.gz bundle
    Extract {
        /// Bundle to unpack
        bundle: PathBuf,

        /// Destination directory
        dest: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Push {
            file,
            tags,
            note,
            chunk_size_bytes,
            archive_id,
            dry_run,
        } => {
            commands::push(
                config,
                commands::PushArgs {
                    file,
                    tags,
                    note,
                    chunk_size_bytes,
                    archive_id,
                    dry_run,
                },
            )?;
        }
        Commands::Pull {
            archive_id,
            outdir,
            dry_run,
            extract,
        } => {
            commands::pull(config, &archive_id, outdir, dry_run, extract)?;
        }
        Commands::BuildIndex { latest_n, dry_run } => {
            commands::build_index(config, latest_n, dry_run)?;
        }
        Commands::List {
            tag,
            query,
            limit,
            json,
        } => {
            commands::list(config, tag, query, limit, json)?;
        }
        Commands::Extract { bundle, dest } => {
            commands::extract(&bundle, &dest)?;
        }
    }

    Ok(())
}
