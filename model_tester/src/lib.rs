//! Dual-engine model tester.
//!
//! Runs an ONNX model through a frame-budgeted, layer-by-layer execution
//! path and cross-checks its outputs against an independent full-pass
//! execution of the same model file.

pub mod compare;
pub mod display;
pub mod driver;
pub mod engine;
pub mod nn;
pub mod tester;
