//! Model configuration.
//!
//! A `Config` is immutable once a model is built from it. Every constructor
//! that accepts one calls [`Config::validate`] first, so an inconsistent
//! configuration is rejected before any parameter is allocated.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CortexError, Result};

/// One class per byte value.
pub const VOCAB_SIZE: usize = 256;

/// How the state-space recurrence is evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanMode {
    /// Plain time-ordered loop over a single recurrent state.
    Sequential,
    /// Chunked prefix scan: chunks are scanned in parallel, then stitched
    /// together by propagating each chunk's carry.
    Chunked { chunk_len: usize },
}

impl Default for ScanMode {
    fn default() -> Self {
        ScanMode::Sequential
    }
}

/// Sizing and behaviour parameters shared by every component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Model width `d`.
    pub d_model: usize,

    /// Total number of stacked blocks. Even indices are state-space blocks,
    /// odd indices are attention blocks.
    pub n_layers: usize,

    /// Attention heads per attention block. Must divide `d_model`.
    pub n_heads: usize,

    /// Number of experts in the MoE layer.
    pub n_experts: usize,

    /// Experts selected per token.
    pub top_k: usize,

    /// Longest accepted input sequence.
    pub max_seq_len: usize,

    /// Dropout probability, applied in training mode only.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Hidden state size per channel in the state-space recurrence.
    #[serde(default = "default_d_state")]
    pub d_state: usize,

    /// Feed-forward expansion factor for experts and attention blocks.
    #[serde(default = "default_ffn_mult")]
    pub ffn_mult: usize,

    /// LayerNorm epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,

    /// Mask future positions in attention blocks.
    #[serde(default)]
    pub causal_attention: bool,

    /// Recurrence evaluation strategy.
    #[serde(default)]
    pub scan: ScanMode,
}

fn default_dropout() -> f32 {
    0.1
}
fn default_d_state() -> usize {
    16
}
fn default_ffn_mult() -> usize {
    4
}
fn default_norm_eps() -> f32 {
    1e-5
}

impl Default for Config {
    fn default() -> Self {
        Self::cortex1()
    }
}

impl Config {
    /// Full-size preset: 8 alternating blocks at width 512, 8 experts, top-2.
    pub fn cortex1() -> Self {
        Self {
            d_model: 512,
            n_layers: 8,
            n_heads: 8,
            n_experts: 8,
            top_k: 2,
            max_seq_len: 1024,
            dropout: default_dropout(),
            d_state: default_d_state(),
            ffn_mult: default_ffn_mult(),
            norm_eps: default_norm_eps(),
            causal_attention: false,
            scan: ScanMode::Sequential,
        }
    }

    /// Small preset for tests and demos.
    pub fn tiny() -> Self {
        Self {
            d_model: 16,
            n_layers: 2,
            n_heads: 2,
            n_experts: 4,
            top_k: 2,
            max_seq_len: 64,
            dropout: 0.0,
            d_state: 4,
            ffn_mult: 4,
            norm_eps: default_norm_eps(),
            causal_attention: false,
            scan: ScanMode::Sequential,
        }
    }

    /// Per-head width.
    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// Inner width of every feed-forward sublayer.
    pub fn d_ff(&self) -> usize {
        self.d_model * self.ffn_mult
    }

    /// Whether layer `idx` is a state-space block.
    pub fn is_state_space_layer(&self, idx: usize) -> bool {
        idx % 2 == 0
    }

    /// Check every cross-field invariant.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(CortexError::BadConfig(msg));

        if self.d_model == 0 {
            return bad("d_model must be positive".into());
        }
        if self.n_heads == 0 {
            return bad("n_heads must be positive".into());
        }
        if self.d_model % self.n_heads != 0 {
            return bad(format!(
                "d_model ({}) is not divisible by n_heads ({})",
                self.d_model, self.n_heads
            ));
        }
        if self.n_experts == 0 {
            return bad("n_experts must be positive".into());
        }
        if self.top_k == 0 {
            return bad("top_k must be positive".into());
        }
        if self.top_k > self.n_experts {
            return bad(format!(
                "top_k ({}) exceeds n_experts ({})",
                self.top_k, self.n_experts
            ));
        }
        if self.max_seq_len == 0 {
            return bad("max_seq_len must be positive".into());
        }
        if self.d_state == 0 {
            return bad("d_state must be positive".into());
        }
        if self.ffn_mult == 0 {
            return bad("ffn_mult must be positive".into());
        }
        if self.dropout.is_nan() || !(0.0..1.0).contains(&self.dropout) {
            return bad(format!("dropout ({}) must lie in [0, 1)", self.dropout));
        }
        if self.norm_eps.is_nan() || self.norm_eps <= 0.0 {
            return bad("norm_eps must be positive".into());
        }
        if let ScanMode::Chunked { chunk_len: 0 } = self.scan {
            return bad("chunk_len must be positive".into());
        }
        Ok(())
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Exact number of learnable parameters of a model built from this config.
    pub fn param_count(&self) -> usize {
        let d = self.d_model;
        let n = self.d_state;
        let ff = self.d_ff();
        let linear = |i: usize, o: usize| i * o + o;

        let embedding = VOCAB_SIZE * d;
        let state_space = linear(d, 2 * d) // in_proj
            + linear(d, d) // dt_proj
            + 2 * linear(d, n) // b_proj, c_proj
            + d * n // A
            + d // D
            + linear(d, d); // out_proj
        let attention = 4 * linear(d, d) + linear(d, ff) + linear(ff, d) + 2 * (2 * d);
        let layers: usize = (0..self.n_layers)
            .map(|i| {
                if self.is_state_space_layer(i) {
                    state_space
                } else {
                    attention
                }
            })
            .sum();
        let expert = linear(d, ff) + linear(ff, d);
        let moe = linear(d, self.n_experts) + self.n_experts * expert;
        let head = 2 * d + linear(d, VOCAB_SIZE);

        embedding + layers + moe + head
    }
}
