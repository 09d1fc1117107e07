//! Frame-budgeted inference driver.
//!
//! Spreads one forward pass over several frame ticks instead of blocking
//! a single one: each call advances the active pass by at most a fixed
//! number of steps. At most one pass is in flight at a time; a started
//! pass always runs to completion across ticks.

use std::{sync::Arc, time::Instant};

use anyhow::Result;

use crate::{
    display::DisplaySink,
    engine::{IncrementalRun, InputTensor, StepwiseEngine},
};

/// Result of one driver call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// No pass active and no input available; nothing happened.
    Idle,
    /// The pass advanced but work remains for the next tick.
    Running { steps: usize },
    /// The pass finished this tick; the output went to the display sink.
    Completed { steps: usize },
}

/// Timing of the most recent driver call.
#[derive(Clone, Copy, Debug)]
pub struct StepStats {
    pub steps: usize,
    pub elapsed_ms: f64,
}

/// Per-call step cap so a pass over `layer_count` layers spans at most
/// `frames_to_execute` ticks.
pub fn step_budget(layer_count: usize, frames_to_execute: usize) -> usize {
    let frames = frames_to_execute.max(1);
    ((layer_count + frames - 1) / frames).max(1)
}

pub struct InferenceDriver {
    engine: Arc<dyn StepwiseEngine>,
    sink: Box<dyn DisplaySink>,
    output_index: Option<usize>,
    cursor: Option<Box<dyn IncrementalRun>>,
    last_stats: Option<StepStats>,
}

impl InferenceDriver {
    /// `output_index` selects which output goes to the sink on
    /// completion; `None` means the model's last declared output.
    pub fn new(
        engine: Arc<dyn StepwiseEngine>,
        output_index: Option<usize>,
        sink: Box<dyn DisplaySink>,
    ) -> Self {
        Self {
            engine,
            sink,
            output_index,
            cursor: None,
            last_stats: None,
        }
    }

    /// Whether a pass is currently in flight.
    pub fn has_active_pass(&self) -> bool {
        self.cursor.is_some()
    }

    /// Timing of the most recent call, if any.
    pub fn last_stats(&self) -> Option<StepStats> {
        self.last_stats
    }

    /// Start a pass on `input` or advance the active one by at most
    /// `step_budget` steps.
    ///
    /// With no active pass and no input this is a no-op: the harness may
    /// tick before its frame source is ready. `input` is ignored while a
    /// pass is active. On completion the selected output is reshaped to
    /// rank 4 and handed to the display sink, and the cursor is reset so
    /// the next call starts a fresh pass.
    pub fn begin_or_continue(
        &mut self,
        input: Option<&InputTensor>,
        step_budget: usize,
    ) -> Result<StepOutcome> {
        let budget = step_budget.max(1);

        if self.cursor.is_none() {
            match input {
                Some(input) => self.cursor = Some(self.engine.begin(input)?),
                None => return Ok(StepOutcome::Idle),
            }
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(StepOutcome::Idle);
        };

        let started = Instant::now();
        let advanced = advance_cursor(cursor.as_mut(), budget);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;

        let (steps, more_work) = match advanced {
            Ok(progress) => progress,
            Err(err) => {
                // a failed pass cannot be resumed
                self.cursor = None;
                return Err(err);
            }
        };

        self.last_stats = Some(StepStats { steps, elapsed_ms });
        log::debug!(
            "Executed {} layers in {:.3} ms, more work: {}",
            steps,
            elapsed_ms,
            more_work
        );

        if more_work {
            return Ok(StepOutcome::Running { steps });
        }

        if let Some(done) = self.cursor.take() {
            let output = done.output(self.output_index)?.into_rank4();
            self.sink.present(&output)?;
        }

        Ok(StepOutcome::Completed { steps })
    }
}

fn advance_cursor(cursor: &mut dyn IncrementalRun, budget: usize) -> Result<(usize, bool)> {
    let mut steps = 0;
    let mut more_work = cursor.has_more_work();

    while more_work && steps < budget {
        more_work = cursor.advance()?;
        steps += 1;
    }

    Ok((steps, more_work))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FlatOutput, Shape};
    use anyhow::bail;
    use smallvec::smallvec;
    use std::{cell::RefCell, rc::Rc};

    struct MockEngine {
        layers: usize,
        output_shape: Shape,
        passes_begun: Rc<RefCell<usize>>,
    }

    impl MockEngine {
        fn new(layers: usize, output_shape: Shape) -> Self {
            Self {
                layers,
                output_shape,
                passes_begun: Rc::new(RefCell::new(0)),
            }
        }
    }

    struct MockRun {
        remaining: usize,
        output_shape: Shape,
    }

    impl StepwiseEngine for MockEngine {
        fn layer_count(&self) -> usize {
            self.layers
        }

        fn begin(&self, _input: &InputTensor) -> Result<Box<dyn IncrementalRun>> {
            *self.passes_begun.borrow_mut() += 1;
            Ok(Box::new(MockRun {
                remaining: self.layers,
                output_shape: self.output_shape.clone(),
            }))
        }
    }

    impl IncrementalRun for MockRun {
        fn has_more_work(&self) -> bool {
            self.remaining > 0
        }

        fn advance(&mut self) -> Result<bool> {
            if self.remaining == 0 {
                bail!("advanced an exhausted pass");
            }
            self.remaining -= 1;
            Ok(self.remaining > 0)
        }

        fn output(&self, _index: Option<usize>) -> Result<FlatOutput> {
            Ok(FlatOutput {
                name: "out".into(),
                shape: self.output_shape.clone(),
                data: vec![0.5; self.output_shape.iter().product()],
            })
        }

        fn outputs(&self) -> Result<Vec<FlatOutput>> {
            Ok(vec![self.output(None)?])
        }
    }

    struct CollectingSink(Rc<RefCell<Vec<FlatOutput>>>);

    impl DisplaySink for CollectingSink {
        fn present(&mut self, output: &FlatOutput) -> Result<()> {
            self.0.borrow_mut().push(output.clone());
            Ok(())
        }
    }

    fn driver_with(
        layers: usize,
        output_shape: Shape,
    ) -> (InferenceDriver, Rc<RefCell<Vec<FlatOutput>>>) {
        let presented = Rc::new(RefCell::new(Vec::new()));
        let driver = InferenceDriver::new(
            Arc::new(MockEngine::new(layers, output_shape)),
            None,
            Box::new(CollectingSink(Rc::clone(&presented))),
        );
        (driver, presented)
    }

    fn input() -> InputTensor {
        InputTensor::new(smallvec![1, 3, 2, 2], vec![0.0; 12])
    }

    fn calls_to_complete(layers: usize, budget: usize) -> usize {
        let (mut driver, _) = driver_with(layers, smallvec![1, 1, 2, 2]);
        let input = input();
        for call in 1.. {
            match driver.begin_or_continue(Some(&input), budget).unwrap() {
                StepOutcome::Completed { .. } => return call,
                StepOutcome::Running { .. } => continue,
                StepOutcome::Idle => panic!("driver went idle with input present"),
            }
        }
        unreachable!()
    }

    #[test]
    fn completes_in_ceil_layers_over_budget_calls() {
        assert_eq!(calls_to_complete(10, 4), 3);
        assert_eq!(calls_to_complete(10, 10), 1);
        assert_eq!(calls_to_complete(10, 100), 1);
        assert_eq!(calls_to_complete(10, 1), 10);
        assert_eq!(calls_to_complete(7, 3), 3);
    }

    #[test]
    fn budget_from_frames_to_execute_bounds_tick_count() {
        // L = 10 layers over f = 3 frames: budget 4, done in 3 ticks
        let budget = step_budget(10, 3);
        assert_eq!(budget, 4);
        assert_eq!(calls_to_complete(10, budget), 3);

        // f >= L: everything in one tick
        assert_eq!(step_budget(10, 100), 1);
        assert_eq!(calls_to_complete(10, step_budget(10, 10)), 10);
    }

    #[test]
    fn no_input_and_no_pass_is_a_noop() {
        let (mut driver, presented) = driver_with(3, smallvec![1, 1, 2, 2]);
        assert_eq!(
            driver.begin_or_continue(None, 5).unwrap(),
            StepOutcome::Idle
        );
        assert!(!driver.has_active_pass());
        assert!(presented.borrow().is_empty());
    }

    #[test]
    fn input_midway_does_not_restart_the_pass() {
        let (mut driver, _) = driver_with(4, smallvec![1, 1, 2, 2]);
        let engine_input = input();

        assert_eq!(
            driver.begin_or_continue(Some(&engine_input), 2).unwrap(),
            StepOutcome::Running { steps: 2 }
        );
        // a fresh input while running is ignored; pass continues
        assert_eq!(
            driver.begin_or_continue(Some(&engine_input), 2).unwrap(),
            StepOutcome::Completed { steps: 2 }
        );
    }

    #[test]
    fn completed_pass_resets_and_restarts_from_scratch() {
        let presented = Rc::new(RefCell::new(Vec::new()));
        let engine = MockEngine::new(3, smallvec![1, 1, 2, 2]);
        let passes = Rc::clone(&engine.passes_begun);
        let mut driver = InferenceDriver::new(
            Arc::new(engine),
            None,
            Box::new(CollectingSink(Rc::clone(&presented))),
        );
        let engine_input = input();

        assert_eq!(
            driver.begin_or_continue(Some(&engine_input), 5).unwrap(),
            StepOutcome::Completed { steps: 3 }
        );
        assert!(!driver.has_active_pass());

        // next call starts a whole new pass from layer 0
        assert_eq!(
            driver.begin_or_continue(Some(&engine_input), 5).unwrap(),
            StepOutcome::Completed { steps: 3 }
        );
        assert_eq!(*passes.borrow(), 2);
        assert_eq!(presented.borrow().len(), 2);
    }

    struct FlakyEngine {
        inner: MockEngine,
        failures_left: RefCell<usize>,
    }

    struct FailingRun;

    impl StepwiseEngine for FlakyEngine {
        fn layer_count(&self) -> usize {
            self.inner.layer_count()
        }

        fn begin(&self, input: &InputTensor) -> Result<Box<dyn IncrementalRun>> {
            // the first pass blows up mid-flight, later passes run clean
            let mut failures = self.failures_left.borrow_mut();
            if *failures > 0 {
                *failures -= 1;
                Ok(Box::new(FailingRun))
            } else {
                self.inner.begin(input)
            }
        }
    }

    impl IncrementalRun for FailingRun {
        fn has_more_work(&self) -> bool {
            true
        }

        fn advance(&mut self) -> Result<bool> {
            bail!("node evaluation failed");
        }

        fn output(&self, _index: Option<usize>) -> Result<FlatOutput> {
            bail!("no output on a failed pass");
        }

        fn outputs(&self) -> Result<Vec<FlatOutput>> {
            bail!("no output on a failed pass");
        }
    }

    #[test]
    fn failed_pass_is_dropped_and_next_tick_starts_fresh() {
        let presented = Rc::new(RefCell::new(Vec::new()));
        let engine = FlakyEngine {
            inner: MockEngine::new(3, smallvec![1, 1, 2, 2]),
            failures_left: RefCell::new(1),
        };
        let mut driver = InferenceDriver::new(
            Arc::new(engine),
            None,
            Box::new(CollectingSink(Rc::clone(&presented))),
        );
        let engine_input = input();

        assert!(driver.begin_or_continue(Some(&engine_input), 2).is_err());
        assert!(!driver.has_active_pass());
        assert!(presented.borrow().is_empty());

        // the error is recoverable: the next call begins a new pass
        assert_eq!(
            driver.begin_or_continue(Some(&engine_input), 5).unwrap(),
            StepOutcome::Completed { steps: 3 }
        );
        assert_eq!(presented.borrow().len(), 1);
    }

    #[test]
    fn completed_output_is_reshaped_to_rank_4() {
        let (mut driver, presented) = driver_with(2, smallvec![3, 2, 2]);
        let engine_input = input();

        driver.begin_or_continue(Some(&engine_input), 10).unwrap();

        let presented = presented.borrow();
        assert_eq!(presented.len(), 1);
        let expected: Shape = smallvec![1, 3, 2, 2];
        assert_eq!(presented[0].shape, expected);
    }

    #[test]
    fn budget_formula_clamps_to_one() {
        assert_eq!(step_budget(0, 3), 1);
        assert_eq!(step_budget(5, 0), 5);
        assert_eq!(step_budget(1, 1), 1);
    }
}
