//! imgload: command-line tool for loading container image archives
//!
//! Reads an exported image archive from a file or stdin and restores its
//! layers, images and tags into a storage root. The stored content can then be
//! listed.
//!
//! Set `RUST_LOG=debug` to see what the loader does.

mod output;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use imgload::store::ImageStore;
use imgload::{ConfigFile, LoadOptions, Loader, Storage, TaggedReference};
use output::{ImageListEntry, LayerListEntry, OutputFormat, format_time_ago, output_slice};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(name = "imgload")]
#[command(about = "Load container image archives into local storage", long_about = None)]
struct Cli {
    /// Path to storage root (default: auto-discover)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load an image archive
    Load {
        /// Read from a tar archive file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Suppress the load progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Manage images
    #[command(visible_alias = "images")]
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Manage layers
    #[command(visible_alias = "layers")]
    Layer {
        #[command(subcommand)]
        command: LayerCommands,
    },
}

/// Image subcommands
#[derive(Subcommand)]
enum ImageCommands {
    /// List images in storage
    #[command(visible_alias = "ls")]
    List {
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
        /// Don't truncate image IDs
        #[arg(long)]
        no_trunc: bool,
    },
}

/// Layer subcommands
#[derive(Subcommand)]
enum LayerCommands {
    /// List layers in storage
    #[command(visible_alias = "ls")]
    List {
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
        /// Don't truncate layer IDs
        #[arg(long)]
        no_trunc: bool,
    },
}

/// Log to stderr without timestamps. `RUST_LOG` selects the level, warnings
/// and up when unset.
fn initialize_tracing() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    initialize_tracing();
    let cli = Cli::parse();

    let storage = if let Some(ref root) = cli.root {
        Storage::open(root).context("Failed to open storage")?
    } else {
        Storage::discover().context("Failed to discover storage")?
    };

    match cli.command {
        Commands::Load { input, quiet } => load(&storage, input, quiet)?,
        Commands::Image { command } => match command {
            ImageCommands::List { format, no_trunc } => list_images(&storage, format, no_trunc)?,
        },
        Commands::Layer { command } => match command {
            LayerCommands::List { format, no_trunc } => list_layers(&storage, format, no_trunc)?,
        },
    }

    Ok(())
}

fn load(storage: &Storage, input: Option<PathBuf>, quiet: bool) -> Result<()> {
    let config = ConfigFile::load().context("Failed to read configuration")?;
    let opts = LoadOptions {
        quiet,
        tmp_dir: config.and_then(|c| c.storage.tmp_dir),
    };

    let reader: Box<dyn Read> = match input {
        Some(path) => Box::new(
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    Loader::from_storage(storage)
        .load(reader, &mut out, &opts)
        .context("Failed to load image archive")?;
    out.flush()?;
    Ok(())
}

fn display_id(full_id: &str, no_trunc: bool) -> String {
    if no_trunc {
        full_id.to_string()
    } else {
        imgload::progress::short_id(full_id).to_string()
    }
}

fn created_display(created: Option<&str>) -> String {
    created
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| format_time_ago(c.with_timezone(&Utc)))
        .unwrap_or_else(|| "N/A".to_string())
}

fn list_images(storage: &Storage, format: OutputFormat, no_trunc: bool) -> Result<()> {
    let records = storage
        .image_store()
        .list()
        .context("Failed to list images")?;

    let mut entries: Vec<ImageListEntry> = Vec::with_capacity(records.len());
    for record in &records {
        let image = storage
            .image_store()
            .get(&record.id)
            .with_context(|| format!("Failed to read image {}", record.id))?;
        let rootfs = image.rootfs();

        // Walk the layer stack top-down to sum its size.
        let mut size = 0;
        let mut next = record.layer.clone();
        while let Some(chain_id) = next {
            match storage.layer_store().record(&chain_id)? {
                Some(layer) => {
                    size += layer.diff_size;
                    next = layer.parent;
                }
                None => break,
            }
        }

        let full_id = record.id.to_string();
        let id = display_id(&full_id, no_trunc);
        let created = created_display(record.created.as_deref());
        let entry = |repository: String, tag: String| ImageListEntry {
            repository,
            tag,
            id: id.clone(),
            full_id: full_id.clone(),
            created: created.clone(),
            size,
            layers: rootfs.diff_ids.len(),
        };

        let names = storage.reference_store().tags_for(&record.id)?;
        if names.is_empty() {
            entries.push(entry("<none>".to_string(), "<none>".to_string()));
        }
        for name in &names {
            match TaggedReference::parse(name) {
                Ok(reference) => entries.push(entry(reference.name(), reference.tag().to_string())),
                Err(_) => entries.push(entry(name.clone(), "<none>".to_string())),
            }
        }
    }

    output_slice(&entries, format).context("Failed to output images")?;
    Ok(())
}

fn list_layers(storage: &Storage, format: OutputFormat, no_trunc: bool) -> Result<()> {
    let records = storage
        .layer_store()
        .list()
        .context("Failed to list layers")?;

    let entries: Vec<LayerListEntry> = records
        .into_iter()
        .map(|record| LayerListEntry {
            id: display_id(record.id.as_str(), no_trunc),
            full_id: record.id.to_string(),
            diff_id: display_id(record.diff_id.as_str(), no_trunc),
            parent: record
                .parent
                .as_ref()
                .map(|p| display_id(p.as_str(), no_trunc)),
            cache_id: record.cache_id,
            references: record.references,
            size: record.diff_size,
        })
        .collect();

    output_slice(&entries, format).context("Failed to output layers")?;
    Ok(())
}
