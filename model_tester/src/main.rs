use std::path::PathBuf;

use clap::Parser;
use env_logger::TimestampPrecision;
use frame_source::StaticImageSource;
use model_tester::{
    compare::render_report,
    display::ImageFileSink,
    driver::StepOutcome,
    nn::{parse_dims, LayoutHint},
    tester::{ModelTester, TesterConfig},
};

/// Cross-check an ONNX model between stepwise and full-pass execution.
#[derive(Debug, Parser)]
struct Args {
    /// Path to the ONNX model file.
    #[arg(long)]
    model: PathBuf,

    /// Input image used as the frame source.
    #[arg(long)]
    image: PathBuf,

    /// Model input dims, comma-separated, -1 for dims taken from the frame.
    #[arg(long, default_value = "1,3,-1,-1")]
    input_dims: String,

    /// Input tensor layout: auto, nchw or nhwc.
    #[arg(long, default_value = "auto")]
    layout: String,

    /// Number of frame ticks to spread one inference pass over.
    #[arg(long, default_value_t = 1)]
    frames_to_execute: usize,

    /// Index of the output tensor to display (default: the last one).
    #[arg(long)]
    output_index: Option<usize>,

    /// Min-max normalize the displayed output.
    #[arg(long)]
    normalize_output: bool,

    /// Output name to exclude from the comparison (repeatable).
    #[arg(long = "exclude-output")]
    exclude_outputs: Vec<String>,

    /// Number of ticks to run before finishing.
    #[arg(long, default_value_t = 30)]
    ticks: usize,

    /// Run the dual-engine comparison after the tick loop.
    #[arg(long)]
    compare: bool,

    /// Where to write the displayed output image.
    #[arg(long, default_value = "model_tester_out.png")]
    out: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let args = Args::parse();
    let layout: LayoutHint = args.layout.parse()?;
    let input_dims = parse_dims(&args.input_dims)?;

    let source = StaticImageSource::open(&args.image)?;
    let sink = ImageFileSink::new(args.out, args.normalize_output);

    let config = TesterConfig {
        model_path: args.model,
        input_dims,
        layout,
        frames_to_execute: args.frames_to_execute,
        output_index: args.output_index,
        exclude_outputs: args.exclude_outputs,
    };

    let mut tester = ModelTester::new(config, Box::new(source), Box::new(sink))?;
    log::info!("Step budget: {} layers per tick", tester.step_budget());

    let mut completed = 0;
    for _ in 0..args.ticks {
        // a failed pass is dropped and the next tick starts fresh
        match tester.tick() {
            Ok(StepOutcome::Completed { .. }) => {
                completed += 1;
                if let Some(stats) = tester.last_stats() {
                    log::info!(
                        "Pass completed: executed {} layers in {:.3} ms on the final tick",
                        stats.steps,
                        stats.elapsed_ms
                    );
                }
            }
            Ok(_) => {}
            Err(err) => log::error!("Inference pass failed: {:#}", err),
        }
    }
    log::info!("Completed {} passes in {} ticks", completed, args.ticks);

    if args.compare {
        if let Some(outcome) = tester.compare()? {
            println!("{}", render_report(&outcome));
        }
    }

    Ok(())
}
