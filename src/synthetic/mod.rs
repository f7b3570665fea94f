//! Random geometric transforms rendered as dense synthetic flow.
pub mod generator;
pub mod homography;
pub mod tps;
pub mod transform;

pub use generator::{FixedTransformFlow, RandomTransformFlow, SyntheticFlowGenerator, TransformSampler};
pub use transform::{AffineParams, Transform, TransformFamily};
