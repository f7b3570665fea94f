//! Dense tensors, boolean masks and their image-file I/O.
pub mod io;
pub mod mask;
pub mod tensor;

pub use self::mask::Mask;
pub use self::tensor::{Plane, Tensor};
