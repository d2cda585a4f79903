//! Sparse expert routing: top-k gate, expert networks, and the MoE layer.

pub mod expert;
pub mod moe;
pub mod router;
