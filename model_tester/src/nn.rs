//! tract-onnx backed inference engines.
//!
//! The same model file serves both execution paths: the primary engine
//! walks the optimized graph one node per step (so a pass can be spread
//! over several frame ticks), while the reference engine loads the file
//! fresh and runs a single blocking pass through tract's plan runner.

use std::{collections::HashMap, path::Path};

use anyhow::{bail, ensure, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::engine::{
    FlatOutput, FullPassEngine, IncrementalRun, InputTensor, Shape, StepwiseEngine,
};

type GraphModel = Graph<TypedFact, Box<dyn TypedOp>>;
type PlanModel = SimplePlan<TypedFact, Box<dyn TypedOp>, GraphModel>;

/// Memory layout of an image tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// Layout selection: explicit, or guessed from the dimension sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutHint {
    Auto,
    Nchw,
    Nhwc,
}

impl LayoutHint {
    /// Resolve the hint against concrete or partially known dims.
    ///
    /// `Auto` assumes channels-first when the dimension following the
    /// batch is small (< 10). This is a best-effort default, not a
    /// contract from the model; pass an explicit layout to override it.
    pub fn resolve(self, dims: &[i64]) -> TensorLayout {
        match self {
            LayoutHint::Nchw => TensorLayout::Nchw,
            LayoutHint::Nhwc => TensorLayout::Nhwc,
            LayoutHint::Auto => {
                let lead = dims
                    .len()
                    .checked_sub(3)
                    .map(|i| dims[i])
                    .unwrap_or(1);
                if lead > 0 && lead < 10 {
                    TensorLayout::Nchw
                } else {
                    TensorLayout::Nhwc
                }
            }
        }
    }
}

impl std::str::FromStr for LayoutHint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(LayoutHint::Auto),
            "nchw" => Ok(LayoutHint::Nchw),
            "nhwc" => Ok(LayoutHint::Nhwc),
            other => bail!("unknown layout '{}', expected auto/nchw/nhwc", other),
        }
    }
}

/// Parse a comma-separated dimension list, `-1` marking unknown dims.
pub fn parse_dims(spec: &str) -> Result<Vec<i64>> {
    spec.split(',')
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .with_context(|| format!("invalid dimension '{}'", part.trim()))
        })
        .collect()
}

/// Fill unknown dims from the current frame and return a concrete shape.
///
/// Unknown batch becomes 1, unknown channels become 3, unknown height and
/// width are taken from the frame.
pub fn resolve_input_shape(
    dims: &[i64],
    layout: TensorLayout,
    frame_size: Option<(u32, u32)>,
) -> Result<Shape> {
    ensure!(
        dims.len() == 3 || dims.len() == 4,
        "input must be rank 3 or 4, got rank {}",
        dims.len()
    );

    let offset = dims.len() - 3;
    // positions of (c, h) within the trailing three dims; the remaining
    // slot is the width
    let (ci, hi) = match layout {
        TensorLayout::Nchw => (offset, offset + 1),
        TensorLayout::Nhwc => (offset + 2, offset),
    };

    let mut shape = Shape::new();
    for (i, &dim) in dims.iter().enumerate() {
        let value = if dim > 0 {
            dim as usize
        } else if i < offset {
            1
        } else if i == ci {
            3
        } else {
            let (width, height) =
                frame_size.context("cannot resolve unknown input dims without a frame")?;
            if i == hi {
                height as usize
            } else {
                width as usize
            }
        };
        shape.push(value);
    }

    Ok(shape)
}

/// Image size and channels implied by an input shape and layout.
fn image_dims(shape: &[usize], layout: TensorLayout) -> Result<(usize, usize, usize)> {
    ensure!(
        shape.len() == 3 || shape.len() == 4,
        "input must be rank 3 or 4, got rank {}",
        shape.len()
    );

    let offset = shape.len() - 3;
    let (channels, height, width) = match layout {
        TensorLayout::Nchw => (shape[offset], shape[offset + 1], shape[offset + 2]),
        TensorLayout::Nhwc => (shape[offset + 2], shape[offset], shape[offset + 1]),
    };

    Ok((channels, height, width))
}

/// Convert a frame to a model input tensor.
///
/// The frame is resized with a Triangle filter to the model's expected
/// image size and scaled to `[0, 1]`, filled in the requested layout.
pub fn image_to_input(
    frame: &RgbImage,
    shape: &Shape,
    layout: TensorLayout,
) -> Result<InputTensor> {
    let (channels, height, width) = image_dims(shape, layout)?;
    ensure!(
        channels == 1 || channels == 3,
        "unsupported channel count {}",
        channels
    );

    let resized: RgbImage = if frame.dimensions() == (width as u32, height as u32) {
        frame.clone()
    } else {
        image::imageops::resize(
            frame,
            width as u32,
            height as u32,
            image::imageops::FilterType::Triangle,
        )
    };

    let sample = |x: usize, y: usize, c: usize| -> f32 {
        let pixel = resized[(x as u32, y as u32)];
        if channels == 1 {
            (pixel[0] as f32 + pixel[1] as f32 + pixel[2] as f32) / (3.0 * 255.0)
        } else {
            pixel[c] as f32 / 255.0
        }
    };

    let mut data = Vec::with_capacity(shape.iter().product());
    match layout {
        TensorLayout::Nchw => {
            for c in 0..channels {
                for y in 0..height {
                    for x in 0..width {
                        data.push(sample(x, y, c));
                    }
                }
            }
        }
        TensorLayout::Nhwc => {
            for y in 0..height {
                for x in 0..width {
                    for c in 0..channels {
                        data.push(sample(x, y, c));
                    }
                }
            }
        }
    }

    Ok(InputTensor::new(shape.clone(), data))
}

fn input_to_tensor(input: &InputTensor) -> Result<Tensor> {
    let expected: usize = input.shape.iter().product();
    ensure!(
        input.data.len() == expected,
        "input has {} elements but shape {:?} needs {}",
        input.data.len(),
        input.shape,
        expected
    );

    let array = tract_ndarray::ArrayD::from_shape_vec(
        tract_ndarray::IxDyn(input.shape.as_slice()),
        input.data.clone(),
    )?;
    Ok(array.into())
}

fn flatten_tensor(name: String, tensor: &Tensor) -> Result<FlatOutput> {
    let shape: Shape = tensor.shape().iter().copied().collect();
    let data: Vec<f32> = match tensor.datum_type() {
        DatumType::F32 => tensor.to_array_view::<f32>()?.iter().copied().collect(),
        DatumType::I64 => tensor
            .to_array_view::<i64>()?
            .iter()
            .map(|v| *v as f32)
            .collect(),
        DatumType::I32 => tensor
            .to_array_view::<i32>()?
            .iter()
            .map(|v| *v as f32)
            .collect(),
        dt => bail!("unsupported output datum type {:?} for '{}'", dt, name),
    };

    Ok(FlatOutput { name, shape, data })
}

fn output_name(graph: &GraphModel, outlet: OutletId) -> String {
    graph
        .outlet_label(outlet)
        .map(str::to_owned)
        .unwrap_or_else(|| graph.node(outlet.node).name.clone())
}

fn load_typed_graph(path: &Path, input_shape: &[usize]) -> Result<GraphModel> {
    let fact_dims: TVec<usize> = input_shape.iter().copied().collect();
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to read model {}", path.display()))?
        .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), fact_dims))
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize model")
}

/// Stepwise engine walking the optimized graph node by node.
pub struct TractEngine {
    graph: Arc<GraphModel>,
    steps: Vec<usize>,
    input: OutletId,
}

impl TractEngine {
    /// Load the model at `path` with a concrete f32 input shape.
    pub fn load(path: &Path, input_shape: &[usize]) -> Result<Self> {
        let graph = load_typed_graph(path, input_shape)?;
        ensure!(
            graph.inputs.len() == 1,
            "only single-input models are supported (model has {} inputs)",
            graph.inputs.len()
        );

        let input = graph.inputs[0];
        let order = graph
            .eval_order()
            .context("failed to plan evaluation order")?;
        let steps: Vec<usize> = order.into_iter().filter(|id| *id != input.node).collect();

        log::info!(
            "Loaded {} ({} layers, {} outputs)",
            path.display(),
            steps.len(),
            graph.outputs.len()
        );

        Ok(Self {
            graph: Arc::new(graph),
            steps,
            input,
        })
    }
}

impl StepwiseEngine for TractEngine {
    fn layer_count(&self) -> usize {
        self.steps.len()
    }

    fn begin(&self, input: &InputTensor) -> Result<Box<dyn IncrementalRun>> {
        let tensor = input_to_tensor(input)?;
        let mut values: HashMap<usize, TVec<TValue>> = HashMap::new();
        values.insert(self.input.node, tvec!(tensor.into()));

        Ok(Box::new(TractRun {
            graph: Arc::clone(&self.graph),
            steps: self.steps.clone(),
            pos: 0,
            values,
        }))
    }
}

/// One in-flight pass over a [`TractEngine`] graph.
struct TractRun {
    graph: Arc<GraphModel>,
    steps: Vec<usize>,
    pos: usize,
    values: HashMap<usize, TVec<TValue>>,
}

impl TractRun {
    fn materialize(&self, index: usize) -> Result<FlatOutput> {
        let outlet = self.graph.outputs[index];
        let name = output_name(&self.graph, outlet);
        let node_values = self
            .values
            .get(&outlet.node)
            .with_context(|| format!("output '{}' not computed yet", name))?;

        flatten_tensor(name, &node_values[outlet.slot])
    }
}

impl IncrementalRun for TractRun {
    fn has_more_work(&self) -> bool {
        self.pos < self.steps.len()
    }

    fn advance(&mut self) -> Result<bool> {
        if self.pos >= self.steps.len() {
            return Ok(false);
        }

        let node = self.graph.node(self.steps[self.pos]);
        let mut inputs: TVec<TValue> = tvec!();
        for outlet in &node.inputs {
            let node_values = self
                .values
                .get(&outlet.node)
                .with_context(|| format!("missing input for node '{}'", node.name))?;
            inputs.push(node_values[outlet.slot].clone());
        }

        let outputs = node
            .op
            .eval(inputs)
            .with_context(|| format!("failed to evaluate node '{}'", node.name))?;
        self.values.insert(node.id, outputs);
        self.pos += 1;

        Ok(self.pos < self.steps.len())
    }

    fn output(&self, index: Option<usize>) -> Result<FlatOutput> {
        let count = self.graph.outputs.len();
        ensure!(count > 0, "model declares no outputs");
        let index = index.unwrap_or(count - 1);
        ensure!(
            index < count,
            "output index {} out of range ({} outputs)",
            index,
            count
        );

        self.materialize(index)
    }

    fn outputs(&self) -> Result<Vec<FlatOutput>> {
        (0..self.graph.outputs.len())
            .map(|i| self.materialize(i))
            .collect()
    }
}

/// Reference engine: fresh load from the model path, single blocking run.
pub struct TractReference;

impl FullPassEngine for TractReference {
    fn run_full(&self, model_path: &Path, input: &InputTensor) -> Result<Vec<FlatOutput>> {
        let plan: PlanModel = load_typed_graph(model_path, &input.shape)?
            .into_runnable()
            .context("failed to make model runnable")?;

        let tensor = input_to_tensor(input)?;
        let results = plan.run(tvec!(tensor.into()))?;

        let graph = plan.model();
        results
            .iter()
            .enumerate()
            .map(|(i, tensor)| flatten_tensor(output_name(graph, graph.outputs[i]), tensor))
            .collect()
    }
}
