//! Contains the single cell functionalities: normalisation, gene selection,
//! doublet simulation and the named methods built on top of them.

pub mod doublet_sim;
pub mod hvg;
pub mod methods;
pub mod processing;
