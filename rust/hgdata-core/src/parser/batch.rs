// rust/hgdata-core/src/parser/batch.rs

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::array::{ArrayData, FieldSpec};
use crate::error::{DataError, Result};
use crate::store::Store;

use super::cursor::{derive_seed, BatchPlan, PREPROCESS_DOMAIN};
use super::preprocess::{Preprocessor, SampleContext};

/// One batch of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Position of the batch in the stream, counting across epochs.
    pub index: u64,
    pub epoch: u64,
    /// Position of the batch within its epoch.
    pub step: u64,
    /// Group sample indices, in the order of the batch rows.
    pub sample_indices: Vec<u64>,
    /// One array per field (or per preprocessor output), each shaped
    /// `[len, sample_shape..]`.
    pub arrays: Vec<ArrayData>,
}

impl Batch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.sample_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_indices.is_empty()
    }

    pub fn into_arrays(self) -> Vec<ArrayData> {
        self.arrays
    }
}

/// Turns batch plans into batches: reads the planned samples and applies the
/// preprocessor.
pub(crate) struct BatchAssembler {
    store: Arc<Store>,
    group: String,
    fields: Vec<String>,
    output_specs: Vec<FieldSpec>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    seed: u64,
}

impl BatchAssembler {
    pub(crate) fn new(
        store: Arc<Store>,
        group: String,
        fields: Vec<String>,
        output_specs: Vec<FieldSpec>,
        preprocessor: Option<Arc<dyn Preprocessor>>,
        seed: u64,
    ) -> Self {
        Self {
            store,
            group,
            fields,
            output_specs,
            preprocessor,
            seed,
        }
    }

    pub(crate) fn assemble(&self, plan: BatchPlan) -> Result<Batch> {
        let arrays = self
            .fields
            .iter()
            .map(|field| self.store.read_indices(&self.group, field, &plan.indices))
            .collect::<Result<Vec<_>>>()?;

        let arrays = match &self.preprocessor {
            Some(preprocessor) => self.preprocess(preprocessor.as_ref(), &plan, &arrays)?,
            None => arrays,
        };

        Ok(Batch {
            index: plan.seq,
            epoch: plan.epoch,
            step: plan.step,
            sample_indices: plan.indices,
            arrays,
        })
    }

    fn preprocess(
        &self,
        preprocessor: &dyn Preprocessor,
        plan: &BatchPlan,
        inputs: &[ArrayData],
    ) -> Result<Vec<ArrayData>> {
        let batch_index = plan.seq;
        let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, PREPROCESS_DOMAIN, batch_index));
        let mut columns: Vec<Vec<ArrayData>> = self
            .output_specs
            .iter()
            .map(|_| Vec::with_capacity(plan.indices.len()))
            .collect();

        for (position, &sample_index) in plan.indices.iter().enumerate() {
            let sample = inputs
                .iter()
                .map(|array| array.sample(position))
                .collect::<Result<Vec<_>>>()?;

            let mut ctx = SampleContext {
                epoch: plan.epoch,
                batch_index,
                sample_index,
                position,
                rng: &mut rng,
            };
            // A panic fails this batch only, inline or on a prefetch worker.
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| preprocessor.process(sample, &mut ctx)));
            let outputs = match outcome {
                Ok(result) => {
                    result.map_err(|e| DataError::preprocessing_with_source(batch_index, e))?
                }
                Err(payload) => {
                    return Err(DataError::preprocessing(
                        batch_index,
                        format!(
                            "sample {sample_index}: preprocessor panicked: {}",
                            panic_message(payload.as_ref())
                        ),
                    ));
                }
            };

            if outputs.len() != self.output_specs.len() {
                return Err(DataError::preprocessing(
                    batch_index,
                    format!(
                        "sample {sample_index}: expected {} outputs, got {}",
                        self.output_specs.len(),
                        outputs.len()
                    ),
                ));
            }
            for (column, (output, spec)) in outputs.into_iter().zip(&self.output_specs).enumerate() {
                let actual = output.as_sample_spec();
                if actual != *spec {
                    return Err(DataError::preprocessing(
                        batch_index,
                        format!("sample {sample_index}: output {column} is {actual}, declared {spec}"),
                    ));
                }
                columns[column].push(output);
            }
        }

        columns
            .iter()
            .zip(&self.output_specs)
            .map(|(samples, spec)| ArrayData::stack(spec, samples))
            .collect()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
