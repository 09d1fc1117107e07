//! Tick-driven test harness.
//!
//! Owns the frame source, the stepwise engine, the driver and the
//! comparator, and wires them together once per tick: fetch the current
//! frame, preprocess it, advance the budgeted pass. The comparison is a
//! separate, on-demand blocking call.

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use frame_source::FrameSource;

use crate::{
    compare::{ComparisonOutcome, EngineComparator},
    display::DisplaySink,
    driver::{step_budget, InferenceDriver, StepOutcome, StepStats},
    engine::{FullPassEngine, InputTensor, Shape, StepwiseEngine},
    nn::{image_to_input, resolve_input_shape, LayoutHint, TensorLayout, TractEngine,
        TractReference},
};

/// Harness configuration, collected by the binary's CLI.
#[derive(Clone, Debug)]
pub struct TesterConfig {
    pub model_path: PathBuf,
    /// Model input dims, `-1` for dims to fill in from the frame.
    pub input_dims: Vec<i64>,
    pub layout: LayoutHint,
    /// How many ticks one forward pass may span.
    pub frames_to_execute: usize,
    /// Output to display on completion; `None` selects the last one.
    pub output_index: Option<usize>,
    /// Output names excluded from the engine comparison.
    pub exclude_outputs: Vec<String>,
}

pub struct ModelTester {
    source: Box<dyn FrameSource>,
    engine: Arc<dyn StepwiseEngine>,
    driver: InferenceDriver,
    comparator: EngineComparator,
    model_path: PathBuf,
    input_shape: Shape,
    layout: TensorLayout,
    budget: usize,
    pending_input: Option<InputTensor>,
}

impl ModelTester {
    /// Load the configured model and wire up the tract-backed harness.
    ///
    /// Unknown input dims are resolved from the source's current frame,
    /// so a frame must be available if the dims are not fully specified.
    pub fn new(
        config: TesterConfig,
        source: Box<dyn FrameSource>,
        sink: Box<dyn DisplaySink>,
    ) -> Result<Self> {
        let layout = config.layout.resolve(&config.input_dims);
        let frame_size = source.current_frame().map(|f| f.dimensions());
        let input_shape = resolve_input_shape(&config.input_dims, layout, frame_size)?;

        let engine: Arc<dyn StepwiseEngine> =
            Arc::new(TractEngine::load(&config.model_path, &input_shape)?);

        Ok(Self::from_parts(
            config,
            source,
            sink,
            engine,
            Box::new(TractReference),
            input_shape,
            layout,
        ))
    }

    /// Assemble a harness from explicit collaborators.
    pub fn from_parts(
        config: TesterConfig,
        source: Box<dyn FrameSource>,
        sink: Box<dyn DisplaySink>,
        engine: Arc<dyn StepwiseEngine>,
        reference: Box<dyn FullPassEngine>,
        input_shape: Shape,
        layout: TensorLayout,
    ) -> Self {
        let budget = step_budget(engine.layer_count(), config.frames_to_execute);
        let driver = InferenceDriver::new(Arc::clone(&engine), config.output_index, sink);
        let comparator = EngineComparator::new(reference, config.exclude_outputs);

        Self {
            source,
            engine,
            driver,
            comparator,
            model_path: config.model_path,
            input_shape,
            layout,
            budget,
            pending_input: None,
        }
    }

    /// Per-call step cap derived from the configuration.
    pub fn step_budget(&self) -> usize {
        self.budget
    }

    /// Timing of the most recent tick, if any.
    pub fn last_stats(&self) -> Option<StepStats> {
        self.driver.last_stats()
    }

    /// One frame tick: advance the budgeted pass, starting a new one from
    /// the current frame when idle. Without a frame this is a no-op.
    pub fn tick(&mut self) -> Result<StepOutcome> {
        if !self.driver.has_active_pass() {
            self.pending_input = self.current_input()?;
        }

        let outcome = self
            .driver
            .begin_or_continue(self.pending_input.as_ref(), self.budget)?;

        if let StepOutcome::Completed { .. } = outcome {
            self.pending_input = None;
        }

        Ok(outcome)
    }

    /// Blocking dual-engine comparison on the current frame.
    ///
    /// Returns `None` when no frame is available yet.
    pub fn compare(&mut self) -> Result<Option<ComparisonOutcome>> {
        let Some(input) = self.current_input()? else {
            log::info!("No frame available yet, skipping comparison");
            return Ok(None);
        };

        Ok(Some(
            self.comparator
                .compare(self.engine.as_ref(), &self.model_path, &input),
        ))
    }

    fn current_input(&self) -> Result<Option<InputTensor>> {
        match self.source.current_frame() {
            Some(frame) => Ok(Some(image_to_input(&frame, &self.input_shape, self.layout)?)),
            None => Ok(None),
        }
    }
}
