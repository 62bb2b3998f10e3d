//! Anything and everything related to nearest neighbour graphs

pub mod annoy;
pub mod knn;
