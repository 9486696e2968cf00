//! Applies the non-rigid deformation fields of a registration run to the
//! acquired images and spectral frames, then averages the frame sets
//! before and after warping.

pub mod aggregate;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod sequence;
pub mod warp;
