//! Core module: byte embedding, state-space and attention blocks, shared
//! numeric ops, and the full hybrid model.

pub mod attention;
pub mod embedding;
pub mod model;
pub mod ops;
pub mod scan;
pub mod ssm_state;
pub mod state_space;
