// rust/hgdata-core/src/parser/mod.rs

//! Consumer side: turning a store group into training batches.
//!
//! A [`Parser`] is bound to one group of a store and a list of its fields.
//! It reports the number of batches per epoch ([`Parser::steps`]) and hands
//! out endless batch streams ([`Parser::dataset`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hgdata_core::config::DataConfig;
//! use hgdata_core::parser::Parser;
//! use hgdata_core::storage::LocalStorage;
//!
//! let mut config = DataConfig::default();
//! config.parser.batch_size = 256;
//! config.parser.group = Some("train".to_string());
//!
//! let storage = Arc::new(LocalStorage::new(&config.storage).unwrap());
//! let parser = Parser::open(storage, "mnist-train", &["X"], &config, None).unwrap();
//!
//! let steps = parser.steps();
//! for batch in parser.dataset().unwrap().take(steps as usize) {
//!     let batch = batch.unwrap();
//!     assert_eq!(batch.arrays[0].shape()[1..], [28, 28, 1]);
//! }
//! parser.close();
//! ```

mod batch;
mod cursor;
mod prefetch;
mod preprocess;
mod stream;

pub use batch::Batch;
pub use cursor::{steps_per_epoch, BatchPlan, CursorState, EpochCursor};
pub use preprocess::{FnPreprocessor, Preprocessor, SampleContext};
pub use stream::BatchStream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::array::FieldSpec;
use crate::config::{DataConfig, ParserConfig, PrefetchConfig};
use crate::error::{DataError, Result};
use crate::storage::StorageBackend;
use crate::store::{Store, StoreOptions};

use batch::BatchAssembler;
use prefetch::StopSignal;

/// Batch source bound to the fields of one store group.
pub struct Parser {
    store: Arc<Store>,
    group: String,
    fields: Vec<String>,
    input_specs: Vec<FieldSpec>,
    output_specs: Vec<FieldSpec>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    total: u64,
    config: ParserConfig,
    prefetch: PrefetchConfig,
    /// Set when the store was opened by [`Parser::open`] rather than handed in.
    owns_store: bool,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("store", &self.store.name())
            .field("group", &self.group)
            .field("fields", &self.fields)
            .field("samples", &self.total)
            .field("batch_size", &self.config.batch_size)
            .finish()
    }
}

impl Parser {
    /// Opens store `store_name` and binds a parser to `fields`.
    ///
    /// Uses `config.storage` to open the store, `config.parser` for batching
    /// and `config.prefetch` for background preparation.
    ///
    /// # Errors
    ///
    /// - `StoreNotFound`, `GroupNotFound`, `FieldNotFound` for missing names
    /// - `ShapeMismatch` if the fields differ in length or the preprocessor
    ///   rejects their specs
    /// - `Config` for a zero batch size, an empty group or a `drop_last`
    ///   setting that leaves no batches
    pub fn open<S: AsRef<str>>(
        storage: Arc<dyn StorageBackend>,
        store_name: &str,
        fields: &[S],
        config: &DataConfig,
        preprocessor: Option<Arc<dyn Preprocessor>>,
    ) -> Result<Self> {
        config.parser.validate()?;
        config.prefetch.validate()?;
        let store = Store::open(storage, store_name, &StoreOptions::from(&config.storage))?;
        let mut parser = Self::from_store(
            Arc::new(store),
            fields,
            config.parser.clone(),
            config.prefetch.clone(),
            preprocessor,
        )?;
        parser.owns_store = true;
        Ok(parser)
    }

    /// Binds a parser to `fields` of an already opened store.
    ///
    /// The store stays open when the parser is closed; closing the store
    /// itself ends the streams of every parser built on it.
    pub fn from_store<S: AsRef<str>>(
        store: Arc<Store>,
        fields: &[S],
        config: ParserConfig,
        prefetch: PrefetchConfig,
        preprocessor: Option<Arc<dyn Preprocessor>>,
    ) -> Result<Self> {
        config.validate()?;
        prefetch.validate()?;

        let group = resolve_group(&store, config.group.as_deref())?;

        if fields.is_empty() {
            return Err(DataError::config("at least one field is required"));
        }
        let fields: Vec<String> = fields.iter().map(|f| f.as_ref().to_string()).collect();

        let mut input_specs = Vec::with_capacity(fields.len());
        let mut total = None;
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].contains(field) {
                return Err(DataError::config(format!("field '{field}' requested twice")));
            }
            let info = store.field_info(&group, field)?;
            match total {
                None => total = Some((field.as_str(), info.len)),
                Some((first, len)) if len != info.len => {
                    return Err(DataError::shape_mismatch(format!(
                        "field '{field}' has {} samples but '{first}' has {len}",
                        info.len
                    )));
                }
                Some(_) => {}
            }
            input_specs.push(info.spec);
        }
        let total = total.map_or(0, |(_, len)| len);

        if total == 0 {
            return Err(DataError::config(format!("group '{group}' has no samples")));
        }
        let batch_size = config.batch_size as u64;
        if config.drop_last && total < batch_size {
            return Err(DataError::config(format!(
                "drop_last with {total} samples and batch size {batch_size} leaves no batches"
            )));
        }

        let output_specs = match &preprocessor {
            Some(preprocessor) => preprocessor.bind(&input_specs).map_err(|e| {
                DataError::shape_mismatch(format!("preprocessor rejected the fields: {e}"))
            })?,
            None => input_specs.clone(),
        };

        for field in &fields {
            store.bind_field(&group, field)?;
        }

        info!(
            store = store.name(),
            group = %group,
            fields = ?fields,
            samples = total,
            batch_size,
            steps = steps_per_epoch(total, batch_size, config.drop_last),
            "Opened parser"
        );

        Ok(Self {
            store,
            group,
            fields,
            input_specs,
            output_specs,
            preprocessor,
            total,
            config,
            prefetch,
            owns_store: false,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of batches per epoch.
    pub fn steps(&self) -> u64 {
        steps_per_epoch(self.total, self.config.batch_size as u64, self.config.drop_last)
    }

    /// Starts a new batch stream at the beginning of epoch 0.
    ///
    /// Every call returns an independent stream. Without a configured seed
    /// each stream draws its own; see [`BatchStream::seed`].
    pub fn dataset(&self) -> Result<BatchStream> {
        if self.is_closed() {
            return Err(DataError::closed(format!("parser for store '{}'", self.store.name())));
        }

        let seed = self.config.seed.unwrap_or_else(rand::random);
        let cursor = EpochCursor::new(
            self.total,
            self.config.batch_size as u64,
            self.config.drop_last,
            self.config.shuffle,
            seed,
        )?;
        let assembler = Arc::new(BatchAssembler::new(
            Arc::clone(&self.store),
            self.group.clone(),
            self.fields.clone(),
            self.output_specs.clone(),
            self.preprocessor.clone(),
            seed,
        ));
        let stop = StopSignal::new(Arc::clone(&self.closed), Arc::clone(&self.store));

        debug!(
            group = %self.group,
            seed,
            shuffle = self.config.shuffle,
            workers = self.prefetch.workers,
            "Starting batch stream"
        );

        Ok(if self.prefetch.workers == 0 {
            BatchStream::inline(cursor, assembler, stop, seed)
        } else {
            BatchStream::prefetched(
                cursor,
                assembler,
                self.prefetch.workers,
                self.prefetch.depth,
                stop,
                seed,
            )
        })
    }

    /// Stops every stream of this parser. Idempotent.
    ///
    /// A store opened by [`Parser::open`] is closed as well.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if self.owns_store {
                self.store.close();
            }
            info!(store = self.store.name(), group = %self.group, "Closed parser");
        }
    }

    /// True once the parser or its store has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.store.is_closed()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of samples in one epoch.
    pub fn num_samples(&self) -> u64 {
        self.total
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Specs of the stored fields, in request order.
    pub fn input_specs(&self) -> &[FieldSpec] {
        &self.input_specs
    }

    /// Specs of the arrays in each batch (after preprocessing).
    pub fn output_specs(&self) -> &[FieldSpec] {
        &self.output_specs
    }
}

fn resolve_group(store: &Store, configured: Option<&str>) -> Result<String> {
    if let Some(name) = configured {
        return store.group(name).map(|g| g.name().to_string());
    }
    match store.group_names().as_slice() {
        [only] => Ok(only.to_string()),
        [] => Err(DataError::config(format!(
            "store '{}' has no groups",
            store.name()
        ))),
        many => Err(DataError::config(format!(
            "store '{}' has groups {many:?}; set parser.group to pick one",
            store.name()
        ))),
    }
}
