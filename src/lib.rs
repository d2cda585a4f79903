//! # CORTEX
//!
//! A byte-level hybrid sequence model: no tokenizer, 256 classes, one per
//! byte value.
//!
//! ## Components
//!
//! 1. **ByteEmbedding**: learned vector per byte
//! 2. **StateSpaceBlock**: selective linear recurrence, linear in sequence length
//! 3. **AttentionBlock**: multi-head self-attention with a feed-forward sublayer
//! 4. **GatingRouter**: top-k expert selection with softmax over the chosen k
//! 5. **MoELayer**: sparse dispatch to feed-forward experts, weighted recombination
//! 6. **HybridModel**: alternating SSM/attention stack, MoE, LayerNorm, 256-way head
//!
//! ## Layout
//!
//! - Even layer indices are state-space blocks, odd ones attention blocks.
//! - All tensors are `[batch, len, d_model]`; every block preserves shape.
//! - Evaluation is a pure function of parameters and input. Dropout runs
//!   only when a random source is passed in.

pub mod batch;
pub mod config;
pub mod core;
pub mod error;
pub mod routing;

pub use batch::ByteBatch;
pub use config::{Config, ScanMode, VOCAB_SIZE};
pub use core::model::{HybridModel, LayerKind, ModelOutput};
pub use error::{CortexError, Result};
pub use routing::router::{GatingDecision, LoadBalanceStats};
