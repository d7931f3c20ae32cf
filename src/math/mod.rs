//! # Vector Math
//!
//! Distance kernels (with SIMD dispatch) and the bounded top-k heap that
//! every kNN code path shares.

pub mod distance;
pub mod knn;

pub use distance::{distance_f64, kernel_f32, weighted_f32, weights_are_unit, Distance, KernelF32};
pub use knn::{KnnHeap, Neighbor};
