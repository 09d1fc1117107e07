//! Engine-neutral tensor types and execution traits.
//!
//! Any backend that can run a model step by step plugs in through
//! [`StepwiseEngine`]; any backend that runs a whole pass in one blocking
//! call plugs in through [`FullPassEngine`]. The driver and comparator
//! only see these traits.

use std::path::Path;

use anyhow::Result;
use smallvec::SmallVec;

/// Tensor shape as ordered dimension sizes.
pub type Shape = SmallVec<[usize; 4]>;

/// Dense f32 input tensor handed to an engine.
#[derive(Clone, Debug, PartialEq)]
pub struct InputTensor {
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl InputTensor {
    pub fn new(shape: Shape, data: Vec<f32>) -> Self {
        Self { shape, data }
    }
}

/// Named output tensor flattened to f32, as produced by either engine.
#[derive(Clone, Debug, PartialEq)]
pub struct FlatOutput {
    pub name: String,
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl FlatOutput {
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Canonicalize to rank 4 by prepending size-1 leading dimensions.
    ///
    /// Tensors of rank 4 or higher pass through unchanged.
    pub fn into_rank4(mut self) -> Self {
        while self.shape.len() < 4 {
            self.shape.insert(0, 1);
        }
        self
    }
}

/// One in-flight forward pass, resumable step by step.
///
/// The sequence is the only suspension point of a pass: the driver resumes
/// it once per frame tick until it reports exhaustion.
pub trait IncrementalRun {
    /// Whether any steps remain.
    fn has_more_work(&self) -> bool;

    /// Execute one step. Returns whether more work remains afterwards.
    fn advance(&mut self) -> Result<bool>;

    /// Fetch one finished output by declaration index (`None` = last).
    ///
    /// Only valid once [`Self::has_more_work`] returns false.
    fn output(&self, index: Option<usize>) -> Result<FlatOutput>;

    /// Fetch all finished outputs in declaration order.
    fn outputs(&self) -> Result<Vec<FlatOutput>>;
}

/// Engine able to split one forward pass into resumable steps.
pub trait StepwiseEngine {
    /// Number of steps a full pass takes.
    fn layer_count(&self) -> usize;

    /// Begin a new pass over `input`.
    fn begin(&self, input: &InputTensor) -> Result<Box<dyn IncrementalRun>>;
}

/// Engine running one complete, blocking pass from a model file.
pub trait FullPassEngine {
    /// Run the model at `model_path` on `input` and collect all outputs.
    fn run_full(&self, model_path: &Path, input: &InputTensor) -> Result<Vec<FlatOutput>>;
}

/// Drive a stepwise pass to completion and collect all outputs.
pub fn run_to_completion(
    engine: &dyn StepwiseEngine,
    input: &InputTensor,
) -> Result<Vec<FlatOutput>> {
    let mut run = engine.begin(input)?;
    while run.has_more_work() {
        run.advance()?;
    }
    run.outputs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn output(shape: &[usize]) -> FlatOutput {
        FlatOutput {
            name: "out".into(),
            shape: shape.iter().copied().collect(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    #[test]
    fn rank3_gets_leading_unit_dimension() {
        let reshaped = output(&[3, 4, 5]).into_rank4();
        let expected: Shape = smallvec![1, 3, 4, 5];
        assert_eq!(reshaped.shape, expected);
    }

    #[test]
    fn rank1_gets_three_leading_unit_dimensions() {
        let reshaped = output(&[7]).into_rank4();
        let expected: Shape = smallvec![1, 1, 1, 7];
        assert_eq!(reshaped.shape, expected);
    }

    #[test]
    fn rank4_passes_through_unchanged() {
        let reshaped = output(&[1, 3, 4, 5]).into_rank4();
        let expected: Shape = smallvec![1, 3, 4, 5];
        assert_eq!(reshaped.shape, expected);
    }
}
