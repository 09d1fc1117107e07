//! Dual-engine output comparison.
//!
//! Runs the same input once through the reference engine (full blocking
//! pass from the model file) and once through the primary stepwise
//! engine, then scores each named output pair with an index-aligned mean
//! squared error.

use std::fmt::Write;
use std::path::Path;

use crate::engine::{run_to_completion, FullPassEngine, InputTensor, Shape, StepwiseEngine};

/// Mean squared difference between two flat arrays.
///
/// Averaged over the longer length; elements without a counterpart are
/// squared against zero. Differing lengths signal a shape mismatch worth
/// investigating and are logged as a warning, but the value is still
/// computed. Index-aligned and deterministic.
pub fn tensor_difference(a: &[f32], b: &[f32]) -> f32 {
    let min_len = a.len().min(b.len());
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    for i in 0..min_len {
        let diff = (a[i] - b[i]) as f64;
        sum += diff * diff;
    }
    let longer = if a.len() > b.len() { a } else { b };
    for &value in &longer[min_len..] {
        let value = value as f64;
        sum += value * value;
    }

    let difference = (sum / max_len as f64) as f32;

    if a.len() != b.len() {
        log::warn!(
            "Comparing tensors of different lengths ({} vs {}), difference: {}",
            a.len(),
            b.len(),
            difference
        );
    }

    difference
}

/// Score for one named output pair.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputComparison {
    pub name: String,
    pub shape: Shape,
    pub min: f32,
    pub max: f32,
    pub difference: f32,
}

/// Result of one comparison invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum ComparisonOutcome {
    /// The engines disagree on how many outputs the model has; no
    /// per-output scores were computed.
    CountMismatch { reference: usize, primary: usize },
    /// Per-output scores in declaration order, plus their sum.
    Compared {
        records: Vec<OutputComparison>,
        total_error: f32,
    },
}

/// Cross-checks a stepwise engine against a full-pass reference engine.
pub struct EngineComparator {
    reference: Box<dyn FullPassEngine>,
    exclude_outputs: Vec<String>,
}

impl EngineComparator {
    /// Outputs named in `exclude_outputs` are dropped from both engines'
    /// result sets before any check, so synthetic post-processing outputs
    /// never skew the comparison.
    pub fn new(reference: Box<dyn FullPassEngine>, exclude_outputs: Vec<String>) -> Self {
        Self {
            reference,
            exclude_outputs,
        }
    }

    /// Run both engines on `input` and score the aligned outputs.
    ///
    /// An engine failure is caught here, logged, and degrades that side
    /// to an empty output set; the host never aborts on comparison
    /// failure.
    pub fn compare(
        &self,
        primary: &dyn StepwiseEngine,
        model_path: &Path,
        input: &InputTensor,
    ) -> ComparisonOutcome {
        let reference_outputs = match self.reference.run_full(model_path, input) {
            Ok(outputs) => outputs,
            Err(err) => {
                log::error!("Error running reference inference: {:#}", err);
                Vec::new()
            }
        };
        let primary_outputs = match run_to_completion(primary, input) {
            Ok(outputs) => outputs,
            Err(err) => {
                log::error!("Error running primary inference: {:#}", err);
                Vec::new()
            }
        };

        let excluded = |name: &str| self.exclude_outputs.iter().any(|e| e == name);
        let reference_outputs: Vec<_> = reference_outputs
            .into_iter()
            .filter(|o| !excluded(&o.name))
            .collect();
        let primary_outputs: Vec<_> = primary_outputs
            .into_iter()
            .filter(|o| !excluded(&o.name))
            .collect();

        if reference_outputs.len() != primary_outputs.len() {
            return ComparisonOutcome::CountMismatch {
                reference: reference_outputs.len(),
                primary: primary_outputs.len(),
            };
        }

        let mut records = Vec::with_capacity(primary_outputs.len());
        let mut total_error = 0.0f32;

        for output in &primary_outputs {
            let reference_data = match reference_outputs.iter().find(|o| o.name == output.name) {
                Some(counterpart) => counterpart.data.as_slice(),
                None => {
                    log::warn!("Reference engine produced no output named '{}'", output.name);
                    &[]
                }
            };

            let difference = tensor_difference(reference_data, &output.data);
            total_error += difference;

            let (min, max) = min_max(&output.data);
            records.push(OutputComparison {
                name: output.name.clone(),
                shape: output.shape.clone(),
                min,
                max,
                difference,
            });
        }

        ComparisonOutcome::Compared {
            records,
            total_error,
        }
    }
}

fn min_max(data: &[f32]) -> (f32, f32) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    data.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &v| {
        (min.min(v), max.max(v))
    })
}

/// Human-readable comparison report. Presentation only.
pub fn render_report(outcome: &ComparisonOutcome) -> String {
    match outcome {
        ComparisonOutcome::CountMismatch { reference, primary } => format!(
            "Reference engine produced {} tensors, while the primary engine produced {} tensors.",
            reference, primary
        ),
        ComparisonOutcome::Compared {
            records,
            total_error,
        } => {
            let mut report = String::new();
            for (i, record) in records.iter().enumerate() {
                let _ = writeln!(
                    report,
                    "T{} - {} - {:?} - min: {}, max: {} - difference: {}",
                    i, record.name, record.shape, record.min, record.max, record.difference
                );
            }
            let _ = write!(report, "\nTotal error: {}", total_error);
            report
        }
    }
}
