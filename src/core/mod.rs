//! Core building blocks: data structures, linear algebra and graph methods
//! that the single cell methods are assembled from.

pub mod base;
pub mod data;
pub mod graph;
