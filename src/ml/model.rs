// ============================================================
// Layer 5 — Seq2Seq Transformer
// ============================================================
// Encoder-decoder Transformer (Vaswani et al., 2017).
//
//   src ids ─► embed + sinusoid ─► N × EncoderBlock ─► memory
//                                                        │
//   tgt_in  ─► embed + sinusoid ─► N × DecoderBlock ◄────┘
//                                        │
//                                        ▼
//                             Linear (no bias) ─► logits [B, T, V]
//
// Both block types are post-norm: x = LayerNorm(x + sublayer(x)).
// __null__ positions are masked as keys in every attention; the
// decoder self-attention is also causal.

use burn::{
    nn::{
        attention::{generate_autoregressive_mask, MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::{log_softmax, relu},
};

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally — do NOT add them again or you get conflicting impls.
#[derive(Config, Debug)]
pub struct Seq2SeqConfig {
    pub vocab_size:  usize,
    pub d_model:     usize,
    pub d_inner:     usize,
    pub n_head:      usize,
    pub n_layers:    usize,
    pub max_seq_len: usize,
    #[config(default = 0.1)]
    pub dropout:     f64,
    /// Encoder and decoder read from one embedding table
    #[config(default = true)]
    pub share_embeddings: bool,
    #[config(default = 0)]
    pub pad_idx:     usize,
}

impl Seq2SeqConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Seq2Seq<B> {
        let src_embedding = EmbeddingConfig::new(self.vocab_size, self.d_model).init(device);
        let tgt_embedding = (!self.share_embeddings)
            .then(|| EmbeddingConfig::new(self.vocab_size, self.d_model).init(device));

        let encoder = (0..self.n_layers).map(|_| self.build_encoder_block(device)).collect();
        let decoder = (0..self.n_layers).map(|_| self.build_decoder_block(device)).collect();

        let projection = LinearConfig::new(self.d_model, self.vocab_size)
            .with_bias(false)
            .init(device);

        Seq2Seq {
            src_embedding,
            tgt_embedding,
            encoder,
            decoder,
            projection,
            dropout: DropoutConfig::new(self.dropout).init(),
            d_model: self.d_model,
            max_seq_len: self.max_seq_len,
            pad_idx: self.pad_idx,
        }
    }

    fn attention<B: Backend>(&self, device: &B::Device) -> MultiHeadAttention<B> {
        MultiHeadAttentionConfig::new(self.d_model, self.n_head)
            .with_dropout(self.dropout)
            .init(device)
    }

    fn feed_forward<B: Backend>(&self, device: &B::Device) -> FeedForward<B> {
        FeedForward {
            linear1: LinearConfig::new(self.d_model, self.d_inner).init(device),
            linear2: LinearConfig::new(self.d_inner, self.d_model).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }

    fn build_encoder_block<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        EncoderBlock {
            self_attn: self.attention(device),
            ffn:       self.feed_forward(device),
            norm1:     LayerNormConfig::new(self.d_model).init(device),
            norm2:     LayerNormConfig::new(self.d_model).init(device),
            dropout:   DropoutConfig::new(self.dropout).init(),
        }
    }

    fn build_decoder_block<B: Backend>(&self, device: &B::Device) -> DecoderBlock<B> {
        DecoderBlock {
            self_attn:  self.attention(device),
            cross_attn: self.attention(device),
            ffn:        self.feed_forward(device),
            norm1:      LayerNormConfig::new(self.d_model).init(device),
            norm2:      LayerNormConfig::new(self.d_model).init(device),
            norm3:      LayerNormConfig::new(self.d_model).init(device),
            dropout:    DropoutConfig::new(self.dropout).init(),
        }
    }
}

// ─── Building blocks ──────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub linear1: Linear<B>,
    pub linear2: Linear<B>,
    pub dropout: Dropout,
}

impl<B: Backend> FeedForward<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = self.dropout.forward(relu(self.linear1.forward(x)));
        self.linear2.forward(h)
    }
}

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub self_attn: MultiHeadAttention<B>,
    pub ffn:       FeedForward<B>,
    pub norm1:     LayerNorm<B>,
    pub norm2:     LayerNorm<B>,
    pub dropout:   Dropout,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn forward(&self, x: Tensor<B, 3>, pad_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let attn = self
            .self_attn
            .forward(MhaInput::self_attn(x.clone()).mask_pad(pad_mask))
            .context;
        let x = self.norm1.forward(x + self.dropout.forward(attn));
        let ffn = self.ffn.forward(x.clone());
        self.norm2.forward(x + self.dropout.forward(ffn))
    }
}

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub self_attn:  MultiHeadAttention<B>,
    pub cross_attn: MultiHeadAttention<B>,
    pub ffn:        FeedForward<B>,
    pub norm1:      LayerNorm<B>,
    pub norm2:      LayerNorm<B>,
    pub norm3:      LayerNorm<B>,
    pub dropout:    Dropout,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn forward(
        &self,
        x:           Tensor<B, 3>,
        tgt_pad:     Tensor<B, 2, Bool>,
        causal:      Tensor<B, 3, Bool>,
        memory:      Tensor<B, 3>,
        memory_pad:  Tensor<B, 2, Bool>,
    ) -> Tensor<B, 3> {
        let attn = self
            .self_attn
            .forward(MhaInput::self_attn(x.clone()).mask_pad(tgt_pad).mask_attn(causal))
            .context;
        let x = self.norm1.forward(x + self.dropout.forward(attn));

        let cross = self
            .cross_attn
            .forward(MhaInput::new(x.clone(), memory.clone(), memory).mask_pad(memory_pad))
            .context;
        let x = self.norm2.forward(x + self.dropout.forward(cross));

        let ffn = self.ffn.forward(x.clone());
        self.norm3.forward(x + self.dropout.forward(ffn))
    }
}

// ─── Seq2Seq ──────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct Seq2Seq<B: Backend> {
    pub src_embedding: Embedding<B>,
    /// `None` when embeddings are shared with the encoder
    pub tgt_embedding: Option<Embedding<B>>,
    pub encoder:       Vec<EncoderBlock<B>>,
    pub decoder:       Vec<DecoderBlock<B>>,
    pub projection:    Linear<B>,
    pub dropout:       Dropout,
    pub d_model:       usize,
    pub max_seq_len:   usize,
    pub pad_idx:       usize,
}

/// Encoder output plus the source ids it was computed from (kept to
/// rebuild the pad mask after rows are selected or repeated).
#[derive(Debug, Clone)]
pub struct Encoded<B: Backend> {
    pub memory: Tensor<B, 3>,
    pub src:    Tensor<B, 2, Int>,
}

impl<B: Backend> Encoded<B> {
    /// Pick (and possibly repeat) batch rows.
    pub fn select(&self, rows: &[usize]) -> Self {
        let device = self.memory.device();
        let idx: Vec<i32> = rows.iter().map(|&r| r as i32).collect();
        let idx = Tensor::<B, 1, Int>::from_ints(idx.as_slice(), &device);
        Self {
            memory: self.memory.clone().select(0, idx.clone()),
            src:    self.src.clone().select(0, idx),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.src.dims()[0]
    }
}

/// Summed loss over the non-pad target positions of a batch.
pub struct SequenceLoss<B: Backend> {
    pub loss_sum: Tensor<B, 1>,
    /// Correctly predicted non-pad tokens
    pub correct:  Tensor<B, 1, Int>,
    /// Argmax prediction per position, [B, T]
    pub preds:    Tensor<B, 2, Int>,
}

impl<B: Backend> Seq2Seq<B> {
    /// src: [B, S], tgt_in: [B, T] → logits [B, T, V]
    pub fn forward(&self, src: Tensor<B, 2, Int>, tgt_in: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let encoded = self.encode(src);
        self.decode(&encoded, tgt_in)
    }

    pub fn encode(&self, src: Tensor<B, 2, Int>) -> Encoded<B> {
        let src = self.keep_latest(src);
        let pad_mask = self.pad_mask(src.clone());

        let mut x = self.embed(&self.src_embedding, src.clone());
        for block in &self.encoder {
            x = block.forward(x, pad_mask.clone());
        }
        Encoded { memory: x, src }
    }

    pub fn decode(&self, encoded: &Encoded<B>, tgt_in: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let tgt_in = self.keep_latest(tgt_in);
        let [batch_size, tgt_len] = tgt_in.dims();
        let device = tgt_in.device();

        let tgt_pad = self.pad_mask(tgt_in.clone());
        let causal = generate_autoregressive_mask::<B>(batch_size, tgt_len, &device);
        let memory_pad = self.pad_mask(encoded.src.clone());

        let table = self.tgt_embedding.as_ref().unwrap_or(&self.src_embedding);
        let mut x = self.embed(table, tgt_in);
        for block in &self.decoder {
            x = block.forward(
                x,
                tgt_pad.clone(),
                causal.clone(),
                encoded.memory.clone(),
                memory_pad.clone(),
            );
        }
        self.projection.forward(x)
    }

    /// Cross entropy summed over every position whose target is not
    /// __null__. With `smoothing` ε > 0 each token's loss becomes
    /// (1 - ε)·nll + ε·mean(-log p) over the vocabulary.
    pub fn sequence_loss(
        &self,
        logits:    Tensor<B, 3>,
        tgt_out:   Tensor<B, 2, Int>,
        smoothing: f32,
    ) -> SequenceLoss<B> {
        let [batch_size, tgt_len, vocab] = logits.dims();
        let n = batch_size * tgt_len;

        let log_probs = log_softmax(logits.reshape([n, vocab]), 1);
        let targets = tgt_out.reshape([n, 1]);
        let keep = targets.clone().equal_elem(self.pad_idx as i64).bool_not();

        let nll = log_probs.clone().gather(1, targets.clone()).neg();
        let per_token = if smoothing > 0.0 {
            let uniform = log_probs.clone().mean_dim(1).neg();
            nll.mul_scalar(1.0 - smoothing) + uniform.mul_scalar(smoothing)
        } else {
            nll
        };
        let loss_sum = (per_token * keep.clone().float()).sum();

        let preds = log_probs.argmax(1);
        let correct = (preds.clone().equal(targets).int() * keep.int()).sum();

        SequenceLoss {
            loss_sum,
            correct,
            preds: preds.reshape([batch_size, tgt_len]),
        }
    }

    fn embed(&self, table: &Embedding<B>, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [_, len] = ids.dims();
        let device = ids.device();
        let tokens = table.forward(ids);
        let positions = sinusoid_encoding::<B>(len, self.d_model, &device);
        self.dropout.forward(tokens + positions)
    }

    fn pad_mask(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 2, Bool> {
        ids.equal_elem(self.pad_idx as i64)
    }

    /// Keep at most `max_seq_len` positions, dropping the oldest.
    fn keep_latest(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 2, Int> {
        let [batch_size, len] = ids.dims();
        if len <= self.max_seq_len {
            return ids;
        }
        ids.slice([0..batch_size, len - self.max_seq_len..len])
    }
}

/// Fixed sinusoid position table, shape [1, len, d_model]:
///   pe[pos, 2i]   = sin(pos / 10000^(2i/d))
///   pe[pos, 2i+1] = cos(pos / 10000^(2i/d))
pub fn sinusoid_encoding<B: Backend>(len: usize, d_model: usize, device: &B::Device) -> Tensor<B, 3> {
    let mut table = Vec::with_capacity(len * d_model);
    for pos in 0..len {
        for i in 0..d_model {
            let exponent = (2 * (i / 2)) as f64 / d_model as f64;
            let angle = pos as f64 / 10_000f64.powf(exponent);
            let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            table.push(value as f32);
        }
    }
    let data = TensorData::new(table, [len, d_model]).convert::<B::FloatElem>();
    Tensor::<B, 2>::from_data(data, device).unsqueeze::<3>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tiny(share: bool) -> Seq2Seq<TestBackend> {
        Seq2SeqConfig::new(12, 8, 16, 2, 1, 10)
            .with_dropout(0.0)
            .with_share_embeddings(share)
            .init(&Default::default())
    }

    fn ids(rows: &[&[i32]]) -> Tensor<TestBackend, 2, Int> {
        let width = rows[0].len();
        let flat: Vec<i32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::<TestBackend, 1, Int>::from_ints(flat.as_slice(), &Default::default())
            .reshape([rows.len(), width])
    }

    #[test]
    fn test_forward_shape() {
        let model = tiny(true);
        let logits = model.forward(ids(&[&[4, 5, 6], &[7, 0, 0]]), ids(&[&[1, 8], &[1, 9]]));
        assert_eq!(logits.dims(), [2, 2, 12]);
    }

    #[test]
    fn test_unshared_embeddings_have_their_own_table() {
        assert!(tiny(true).tgt_embedding.is_none());
        assert!(tiny(false).tgt_embedding.is_some());
    }

    #[test]
    fn test_sequence_loss_ignores_padding() {
        let model = tiny(true);
        let src = ids(&[&[4, 5]]);
        let logits = model.forward(src, ids(&[&[1, 8, 0]]));

        let padded = model.sequence_loss(logits.clone(), ids(&[&[8, 2, 0]]), 0.0);
        let short_logits = logits.slice([0..1, 0..2, 0..12]);
        let unpadded = model.sequence_loss(short_logits, ids(&[&[8, 2]]), 0.0);

        let a: f64 = padded.loss_sum.into_scalar().elem();
        let b: f64 = unpadded.loss_sum.into_scalar().elem();
        assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        assert!(a > 0.0);
    }

    #[test]
    fn test_label_smoothing_changes_loss() {
        let model = tiny(true);
        let logits = model.forward(ids(&[&[4, 5]]), ids(&[&[1, 8]]));
        let plain: f64 = model
            .sequence_loss(logits.clone(), ids(&[&[8, 2]]), 0.0)
            .loss_sum
            .into_scalar()
            .elem();
        let smooth: f64 = model
            .sequence_loss(logits, ids(&[&[8, 2]]), 0.1)
            .loss_sum
            .into_scalar()
            .elem();
        assert!((plain - smooth).abs() > 1e-6);
    }

    #[test]
    fn test_long_inputs_are_cut_to_latest() {
        let model = tiny(true);
        let long: Vec<i32> = (0..15).map(|i| 4 + (i % 8)).collect();
        let encoded = model.encode(ids(&[long.as_slice()]));
        assert_eq!(encoded.src.dims(), [1, 10]);
    }

    #[test]
    fn test_sinusoid_first_row() {
        let pe = sinusoid_encoding::<TestBackend>(2, 4, &Default::default());
        let values = pe.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        // pos 0: sin(0)=0, cos(0)=1
        assert_eq!(&values[..4], &[0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_encoded_select_repeats_rows() {
        let model = tiny(true);
        let encoded = model.encode(ids(&[&[4, 5], &[6, 7]]));
        let picked = encoded.select(&[1, 1, 1]);
        assert_eq!(picked.batch_size(), 3);
        assert_eq!(picked.memory.dims()[0], 3);
    }
}
