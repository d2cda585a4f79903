//! Top-level model: wires the byte embedding, the alternating
//! state-space / attention stack, the MoE layer, final LayerNorm and the
//! 256-way output head.
//!
//! ```text
//! ids ─► embed ─► [SSM, Attn, SSM, Attn, …] ─► MoE ─► LN ─► head ─► logits
//!                                                            └─► CE(targets)
//! ```

use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::{Config, VOCAB_SIZE};
use crate::core::attention::AttentionBlock;
use crate::core::embedding::ByteEmbedding;
use crate::core::ops::{cross_entropy, flatten_tokens, unflatten_tokens, LayerNorm, Linear};
use crate::core::state_space::StateSpaceBlock;
use crate::error::{CortexError, Result};
use crate::routing::moe::MoELayer;
use crate::routing::router::LoadBalanceStats;

/// One entry of the layer stack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LayerKind {
    /// Even positions. Returns a delta; the stack adds the residual.
    Memory(StateSpaceBlock),
    /// Odd positions. Carries its own sublayer residuals.
    Reasoning(AttentionBlock),
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Memory(_) => "state_space",
            LayerKind::Reasoning(_) => "attention",
        }
    }

    pub fn param_count(&self) -> usize {
        match self {
            LayerKind::Memory(block) => block.param_count(),
            LayerKind::Reasoning(block) => block.param_count(),
        }
    }
}

/// Result of one forward pass.
#[derive(Clone, Debug)]
pub struct ModelOutput {
    /// `[batch, len, 256]`
    pub logits: Array3<f32>,

    /// Mean cross entropy, present when targets were supplied.
    pub loss: Option<f32>,

    /// Expert load over every token of the batch.
    pub routing: LoadBalanceStats,
}

/// The complete hybrid byte model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HybridModel {
    pub config: Config,
    pub embedding: ByteEmbedding,
    pub layers: Vec<LayerKind>,
    pub moe: MoELayer,
    pub norm_f: LayerNorm,
    pub head: Linear,
}

impl HybridModel {
    /// Randomly initialised model. The same `(config, seed)` always yields
    /// the same parameters.
    pub fn new(config: Config, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let d = config.d_model;

        let embedding = ByteEmbedding::init(d, &mut rng);
        let layers = (0..config.n_layers)
            .map(|idx| {
                if config.is_state_space_layer(idx) {
                    LayerKind::Memory(StateSpaceBlock::init(&config, &mut rng))
                } else {
                    LayerKind::Reasoning(AttentionBlock::init(&config, &mut rng))
                }
            })
            .collect();
        let moe = MoELayer::init(&config, &mut rng)?;
        let head = Linear::init(d, VOCAB_SIZE, &mut rng);

        let model = Self {
            norm_f: LayerNorm::new(d, config.norm_eps),
            config,
            embedding,
            layers,
            moe,
            head,
        };
        model.log_summary();
        Ok(model)
    }

    /// Model with every projection zeroed; norms start at identity.
    pub fn zeros(config: Config) -> Result<Self> {
        config.validate()?;
        let d = config.d_model;
        let layers = (0..config.n_layers)
            .map(|idx| {
                if config.is_state_space_layer(idx) {
                    LayerKind::Memory(StateSpaceBlock::zeros(&config))
                } else {
                    LayerKind::Reasoning(AttentionBlock::zeros(&config))
                }
            })
            .collect();
        Ok(Self {
            embedding: ByteEmbedding::zeros(d),
            layers,
            moe: MoELayer::zeros(&config)?,
            norm_f: LayerNorm::new(d, config.norm_eps),
            head: Linear::zeros(d, VOCAB_SIZE),
            config,
        })
    }

    fn log_summary(&self) {
        tracing::info!(
            "Hybrid model: {} layers [{}], d_model={}, {} experts (top-{}), {} params",
            self.layers.len(),
            self.layer_kinds().join(", "),
            self.config.d_model,
            self.config.n_experts,
            self.config.top_k,
            self.param_count(),
        );
    }

    /// Evaluation forward pass. Dropout is disabled, so identical inputs
    /// give bit-identical outputs.
    ///
    /// `ids: [batch, len]` byte values; `targets`, when given, must have the
    /// same shape.
    pub fn forward(&self, ids: &Array2<u32>, targets: Option<&Array2<u32>>) -> Result<ModelOutput> {
        self.run(ids, targets, None)
    }

    /// Training-mode forward pass: dropout draws from `rng`.
    pub fn forward_train(
        &self,
        ids: &Array2<u32>,
        targets: Option<&Array2<u32>>,
        rng: &mut StdRng,
    ) -> Result<ModelOutput> {
        self.run(ids, targets, Some(rng))
    }

    fn run(
        &self,
        ids: &Array2<u32>,
        targets: Option<&Array2<u32>>,
        mut rng: Option<&mut StdRng>,
    ) -> Result<ModelOutput> {
        self.check_input(ids, targets)?;
        let (batch, len) = ids.dim();
        tracing::debug!(batch, len, train = rng.is_some(), "forward");

        let mut x = self.embedding.forward(ids)?;
        for layer in &self.layers {
            x = match layer {
                LayerKind::Memory(block) => &x + &block.forward(&x)?,
                LayerKind::Reasoning(block) => block.forward(&x, rng.as_deref_mut())?,
            };
        }

        let (x, decision) = self.moe.forward_with_decision(&x, rng)?;
        let hidden = self.norm_f.forward(&flatten_tokens(&x)?);
        let logits = self.head.forward(&hidden);

        let loss = targets.map(|t| {
            let flat: Vec<u32> = t.iter().copied().collect();
            cross_entropy(&logits, &flat)
        });
        if let Some(loss) = loss {
            tracing::debug!(loss, "cross entropy");
        }

        Ok(ModelOutput {
            logits: unflatten_tokens(logits, batch, len)?,
            loss,
            routing: decision.load_balance_stats(),
        })
    }

    fn check_input(&self, ids: &Array2<u32>, targets: Option<&Array2<u32>>) -> Result<()> {
        let (batch, len) = ids.dim();
        if batch == 0 || len == 0 {
            return Err(CortexError::EmptyBatch);
        }
        if len > self.config.max_seq_len {
            return Err(CortexError::SequenceTooLong {
                len,
                max: self.config.max_seq_len,
            });
        }
        if let Some(targets) = targets {
            if targets.dim() != ids.dim() {
                return Err(CortexError::ShapeMismatch {
                    expected: format!("{:?}", ids.dim()),
                    got: format!("{:?}", targets.dim()),
                });
            }
            if let Some((position, &value)) = targets
                .iter()
                .enumerate()
                .find(|(_, &v)| v as usize >= VOCAB_SIZE)
            {
                return Err(CortexError::ByteOutOfRange { position, value });
            }
        }
        Ok(())
    }

    /// Layer names in stack order.
    pub fn layer_kinds(&self) -> Vec<&'static str> {
        self.layers.iter().map(LayerKind::name).collect()
    }

    /// Total learnable parameters; matches [`Config::param_count`].
    pub fn param_count(&self) -> usize {
        self.embedding.param_count()
            + self.layers.iter().map(LayerKind::param_count).sum::<usize>()
            + self.moe.param_count()
            + self.norm_f.param_count()
            + self.head.param_count()
    }
}
