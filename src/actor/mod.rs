//! Orchestration of a warp-consistency step around a flow backbone.
//!
//! The backbone is abstracted by [`FlowNetwork`]; an optional
//! [`FeatureExtractor`] capability lets the actor compute each image's
//! pyramid once and share it between the flow directions of the step.
mod engine;
mod context;
mod network;
pub mod validation;

pub use engine::{FlowGradients, LossKind, StepEstimates, StepOutput, WarpConsistencyActor};
pub use context::{Device, ExecutionContext};
pub use network::{FeatureExtractor, FeaturePyramid, FlowNetwork};
