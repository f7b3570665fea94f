//! Flow composition and visibility masks of the warp-consistency graph.
//!
//! Given, per pyramid level, the estimated target-prime → source flow `F1`
//! and source → target flow `F2`, the target-prime → target flow is
//! composed as
//!
//! `F(p) = F1(p) + F2(p + F1(p))`
//!
//! where the second term is `F2` backward-warped by a copy of `F1` rescaled
//! to the level resolution. Estimates at every level are expressed in pixel
//! units of the ground-truth resolution, hence the rescaled copy.
//!
//! Each level also gets a training mask: pixels whose warp sampled inside
//! the image, ANDed with the externally supplied valid mask and, optionally,
//! with a cyclic-consistency mask against the known synthetic flow.
//!
//! [`FlowComposer::backward`] propagates gradients of the composed flows to
//! both estimates. When the warping copy is detached, gradient reaches `F1`
//! only through the additive term.
mod engine;

pub use engine::{ComposedLevel, Composition, ComposerOptions, FlowComposer};
