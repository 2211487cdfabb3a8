// rust/hgdata-tool/src/main.rs

//! Hierarchical Data Tool
//!
//! Inspects and verifies stores written by `hgdata-core`.
//!
//! # Usage
//!
//! ```bash
//! # List groups and fields of a store under ./data
//! hgdata inspect mnist-train
//!
//! # Batches per epoch for a batch size
//! hgdata steps mnist-train --group train --batch-size 256
//!
//! # Check every chunk checksum
//! hgdata --base-path /data/stores verify mnist-train
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hgdata_core::config::DataConfig;
use hgdata_core::storage::{LocalStorage, StorageBackend};
use hgdata_core::store::{Store, StoreOptions, VerifyReport};
use hgdata_core::Parser;

/// Hierarchical array store tool
#[derive(ClapParser, Debug)]
#[command(name = "hgdata")]
#[command(about = "Inspect and verify hierarchical array stores")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the stores (overrides storage.base_path)
    #[arg(short, long, global = true)]
    base_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the groups and fields of a store
    Inspect {
        /// Store name
        store: String,
    },

    /// Print the number of batches per epoch
    Steps {
        /// Store name
        store: String,

        /// Group to read (defaults to parser.group, or the only group)
        #[arg(short, long)]
        group: Option<String>,

        /// Fields to read (defaults to every field of the group)
        #[arg(short, long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Samples per batch (defaults to parser.batch_size)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Drop the last incomplete batch of each epoch
        #[arg(long)]
        drop_last: bool,
    },

    /// Read every chunk of a store and check its checksum
    Verify {
        /// Store name
        store: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &args.config {
        Some(path) => DataConfig::from_file(path)?,
        None => DataConfig::default(),
    }
    .with_env_overrides();
    if let Some(base_path) = args.base_path {
        config.storage.base_path = base_path;
    }
    config.validate()?;

    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);

    match args.command {
        Command::Inspect { store } => {
            for line in inspect(storage, &store, &config)? {
                println!("{line}");
            }
        }
        Command::Steps {
            store,
            group,
            fields,
            batch_size,
            drop_last,
        } => {
            if group.is_some() {
                config.parser.group = group;
            }
            if let Some(batch_size) = batch_size {
                config.parser.batch_size = batch_size;
            }
            config.parser.drop_last |= drop_last;
            println!("{}", steps(storage, &store, fields, &config)?);
        }
        Command::Verify { store } => {
            let report = verify(storage, &store, &config)?;
            println!(
                "ok: {} groups, {} fields, {} chunks, {} samples, {} bytes",
                report.groups, report.fields, report.chunks, report.samples, report.stored_bytes
            );
        }
    }
    Ok(())
}

/// One line for the store, then one per group and one per field.
fn inspect(
    storage: Arc<dyn StorageBackend>,
    name: &str,
    config: &DataConfig,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let store = Store::open(storage, name, &StoreOptions::from(&config.storage))?;

    let mut lines = vec![format!(
        "store {} (generation {})",
        store.name(),
        store.generation()
    )];
    for group_name in store.group_names() {
        lines.push(format!("  {group_name}"));
        for field in store.group(group_name)?.fields() {
            lines.push(format!(
                "    {:<16} {:<20} samples={:<10} compression={:<8} chunks={:<6} bytes={}",
                field.name,
                field.spec.to_string(),
                field.len,
                field.compression.to_string(),
                field.chunks,
                field.stored_bytes
            ));
        }
    }
    Ok(lines)
}

fn steps(
    storage: Arc<dyn StorageBackend>,
    name: &str,
    mut fields: Vec<String>,
    config: &DataConfig,
) -> Result<u64, Box<dyn std::error::Error>> {
    let store = Arc::new(Store::open(
        storage,
        name,
        &StoreOptions::from(&config.storage),
    )?);

    if fields.is_empty() {
        let group = match (&config.parser.group, store.group_names().as_slice()) {
            (Some(group), _) => group.clone(),
            (None, [only]) => only.to_string(),
            (None, groups) => {
                return Err(format!("store '{name}' has groups {groups:?}; pass --group").into())
            }
        };
        fields = store
            .group(&group)?
            .field_names()
            .into_iter()
            .map(str::to_string)
            .collect();
    }

    let parser = Parser::from_store(
        store,
        &fields,
        config.parser.clone(),
        config.prefetch.clone(),
        None,
    )?;

    let steps = parser.steps();
    tracing::info!(
        group = parser.group(),
        samples = parser.num_samples(),
        batch_size = parser.batch_size(),
        steps,
        "Computed steps"
    );
    parser.close();
    Ok(steps)
}

fn verify(
    storage: Arc<dyn StorageBackend>,
    name: &str,
    config: &DataConfig,
) -> Result<VerifyReport, Box<dyn std::error::Error>> {
    // Always check checksums here, whatever the config says.
    let options = StoreOptions {
        verify_checksums: true,
    };
    let store = Store::open(storage, name, &options)?;
    let report = store.verify()?;

    tracing::debug!(base_path = %config.storage.base_path.display(), "Verified store");
    Ok(report)
}
