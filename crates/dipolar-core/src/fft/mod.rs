//! Transform and transpose primitives shared by the kernel build and the
//! dense operator.
//!
//! - [`transform`]: planned 1D transforms along each grid axis, batched over
//!   rows and split across threads with rayon.
//! - [`transpose`]: the cache-blocked local Y/Z transpose and the block
//!   transpose that moves grid ownership between partitions.

pub mod transform;
pub mod transpose;

pub use transform::{Axis, AxisTransforms, Direction};
pub use transpose::{transpose_blocked, BlockTranspose};
