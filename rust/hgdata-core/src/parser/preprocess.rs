// rust/hgdata-core/src/parser/preprocess.rs

//! Per-sample preprocessing hook.

use rand::rngs::StdRng;

use crate::array::{ArrayData, FieldSpec};
use crate::error::BoxError;

/// Randomness and position of the sample being processed.
///
/// `rng` is seeded from the stream seed and the batch index, so the values
/// a preprocessor draws are the same however batches are spread over
/// prefetch workers.
pub struct SampleContext<'a> {
    pub epoch: u64,
    /// Index of the batch in the stream.
    pub batch_index: u64,
    /// Index of the sample in its group.
    pub sample_index: u64,
    /// Position of the sample within its batch.
    pub position: usize,
    pub rng: &'a mut StdRng,
}

/// Transforms one sample (one array per requested field) into one sample of
/// output arrays.
pub trait Preprocessor: Send + Sync {
    /// Declares the output specs for the given input specs.
    ///
    /// Called once when the parser is built. Returning an error rejects the
    /// inputs, which fails parser construction with `ShapeMismatch`.
    fn bind(&self, inputs: &[FieldSpec]) -> Result<Vec<FieldSpec>, BoxError>;

    /// Processes one sample. Outputs must match the specs returned by
    /// [`bind`](Self::bind).
    fn process(
        &self,
        sample: Vec<ArrayData>,
        ctx: &mut SampleContext<'_>,
    ) -> Result<Vec<ArrayData>, BoxError>;
}

/// Adapts a closure with fixed input and output specs.
///
/// ```
/// use hgdata_core::array::{ArrayData, Dtype, FieldSpec};
/// use hgdata_core::parser::FnPreprocessor;
///
/// let image = FieldSpec::new(Dtype::F32, vec![28, 28, 1]);
/// // Emit every image as its own reconstruction target.
/// let autoencoder = FnPreprocessor::new(
///     vec![image.clone()],
///     vec![image.clone(), image],
///     |mut sample: Vec<ArrayData>, _ctx| {
///         let x = sample.remove(0);
///         Ok(vec![x.clone(), x])
///     },
/// );
/// ```
pub struct FnPreprocessor<F> {
    inputs: Vec<FieldSpec>,
    outputs: Vec<FieldSpec>,
    func: F,
}

impl<F> FnPreprocessor<F>
where
    F: Fn(Vec<ArrayData>, &mut SampleContext<'_>) -> Result<Vec<ArrayData>, BoxError> + Send + Sync,
{
    pub fn new(inputs: Vec<FieldSpec>, outputs: Vec<FieldSpec>, func: F) -> Self {
        Self {
            inputs,
            outputs,
            func,
        }
    }
}

impl<F> Preprocessor for FnPreprocessor<F>
where
    F: Fn(Vec<ArrayData>, &mut SampleContext<'_>) -> Result<Vec<ArrayData>, BoxError> + Send + Sync,
{
    fn bind(&self, inputs: &[FieldSpec]) -> Result<Vec<FieldSpec>, BoxError> {
        if inputs != self.inputs.as_slice() {
            let given: Vec<String> = inputs.iter().map(ToString::to_string).collect();
            let declared: Vec<String> = self.inputs.iter().map(ToString::to_string).collect();
            return Err(format!("preprocessor expects {declared:?}, fields are {given:?}").into());
        }
        Ok(self.outputs.clone())
    }

    fn process(
        &self,
        sample: Vec<ArrayData>,
        ctx: &mut SampleContext<'_>,
    ) -> Result<Vec<ArrayData>, BoxError> {
        (self.func)(sample, ctx)
    }
}
