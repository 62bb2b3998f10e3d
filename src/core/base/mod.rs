//! Module containing key statistic functions and the linear algebra used for
//! the embeddings (SVD, PCA).

pub mod pca_svd;
pub mod stats;
