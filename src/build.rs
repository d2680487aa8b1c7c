//! Forward-pass graph construction
//!
//! [`build_phi2`] emits the dataflow graph for one decoder forward pass:
//! token or embedding input, rotary position and mask inputs, the stack of
//! pre-norm / fused-QKV attention / GELU FFN layers with parallel
//! residuals, cache writes interleaved with attention reads, and the final
//! norm plus output projection whose sink carries the logits.
//!
//! The builder wires nodes; it computes nothing and keeps no handle past
//! return. Numeric precision is part of the contract: the KQ matmul (or
//! the fused attention op) must run with F32 accumulation, and Q is scaled
//! by `1/sqrt(n_embd_head)` before attention rather than inside softmax,
//! both of which this architecture needs to avoid NaNs in half precision.

use crate::batch::Batch;
use crate::config::{ContextParams, Hparams, ROPE_TYPE_NEOX};
use crate::dtype::DType;
use crate::error::{BuildError, ConfigError};
use crate::graph::{
    pad_to, Graph, GraphContext, Precision, RopeParams, TensorRef, GRAPH_MAX_NODES, KQ_MASK_PAD,
};
use crate::kv_cache::KvCache;
use crate::model::{Model, Phi2Layer, QkvWeights, WeightTensor};

/// Observer of tensors as the builder names them
///
/// The default implementation ignores everything; a tracing session can
/// install one to follow graph construction layer by layer.
pub trait GraphObserver {
    /// Called after each named tensor is emitted; `layer` is -1 for
    /// tensors outside the decoder stack
    fn on_tensor(&mut self, t: TensorRef, name: &str, layer: i32) {
        let _ = (t, name, layer);
    }
}

/// Observer that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl GraphObserver for NoopObserver {}

/// Observer that records every callback, for tests and debugging
#[derive(Debug, Default)]
pub struct RecordingObserver {
    /// Recorded `(name, layer, node index)` triples in emission order
    pub events: Vec<(String, i32, usize)>,
}

impl GraphObserver for RecordingObserver {
    fn on_tensor(&mut self, t: TensorRef, name: &str, layer: i32) {
        self.events.push((name.to_string(), layer, t.index()));
    }
}

/// Everything one forward-pass build reads, bundled
///
/// The model, parameters, and batch are shared; the cache is exclusive
/// because the builder recomputes its active window for the step.
pub struct BuildCtx<'a> {
    /// Loaded model
    pub model: &'a Model,
    /// Session parameters
    pub cparams: &'a ContextParams,
    /// Input batch
    pub batch: &'a Batch,
    /// Session KV cache
    pub kv: &'a mut KvCache,
    /// Number of positions whose logits are computed; `n_tokens` for
    /// prefill-with-logits, 1 for autoregressive decode
    pub n_outputs: u32,
    /// Build observer
    pub observer: &'a mut dyn GraphObserver,
}

/// Graph-input handles the runtime fills before execution
#[derive(Debug, Clone, Copy)]
pub struct GraphInputs {
    /// Token ids `[n_tokens]`, present on the token path
    pub tokens: Option<TensorRef>,
    /// Embeddings `[n_embd, n_tokens]`, present on the embedding path
    pub embd: Option<TensorRef>,
    /// Positions `[n_tokens]`
    pub pos: TensorRef,
    /// Attention mask input, always F32; the graph casts it to half
    /// precision internally when flash attention is on
    pub kq_mask: TensorRef,
    /// Output row selection `[n_outputs]`
    pub out_ids: Option<TensorRef>,
}

/// A built forward pass
#[derive(Debug)]
pub struct Phi2Graph {
    /// Expanded graph; cache writes and the logits tensor are its sinks
    pub graph: Graph,
    /// Input handles
    pub inputs: GraphInputs,
    /// Logits sink `[n_vocab, n_outputs]`
    pub logits: TensorRef,
}

/// A built pre-step K rotation
pub struct KShiftGraph {
    /// Expanded graph; the per-layer K copy-backs are its sinks
    pub graph: Graph,
    /// Per-slot position delta `[n_ctx]`
    pub k_shift: TensorRef,
}

/// FFN activation function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfnActivation {
    /// SiLU
    Silu,
    /// GELU (the Phi-2 choice)
    Gelu,
    /// ReLU
    Relu,
    /// ReLU then square
    ReluSqr,
}

/// How a gate projection combines with the up projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfnGate {
    /// Gate applied to the up projection's output
    Sequential,
    /// Gate applied to the layer input, multiplied in after activation
    Parallel,
}

fn validate(bctx: &BuildCtx) -> Result<(), BuildError> {
    let cparams = bctx.cparams;
    let batch = bctx.batch;
    let kv = &bctx.kv;

    if kv.size != cparams.n_ctx {
        return Err(ConfigError::CtxMismatch {
            n_ctx: cparams.n_ctx,
            kv_size: kv.size,
        }
        .into());
    }

    if batch.n_tokens == 0 {
        return Err(BuildError::InvalidBatch {
            reason: "batch is empty".to_string(),
        });
    }
    match (&batch.tokens, &batch.embd) {
        (Some(_), Some(_)) => {
            return Err(BuildError::InvalidBatch {
                reason: "both tokens and embeddings are set".to_string(),
            })
        }
        (None, None) => {
            return Err(BuildError::InvalidBatch {
                reason: "neither tokens nor embeddings are set".to_string(),
            })
        }
        _ => {}
    }
    if let Some(tokens) = &batch.tokens {
        if tokens.len() != batch.n_tokens as usize {
            return Err(BuildError::InvalidBatch {
                reason: format!(
                    "{} token ids for n_tokens={}",
                    tokens.len(),
                    batch.n_tokens
                ),
            });
        }
    }
    if batch.pos.len() != batch.n_tokens as usize {
        return Err(BuildError::InvalidBatch {
            reason: format!(
                "{} positions for n_tokens={}",
                batch.pos.len(),
                batch.n_tokens
            ),
        });
    }
    if bctx.n_outputs > batch.n_tokens {
        return Err(BuildError::InvalidBatch {
            reason: format!(
                "n_outputs={} exceeds n_tokens={}",
                bctx.n_outputs, batch.n_tokens
            ),
        });
    }

    if cparams.n_ctx < batch.n_tokens + kv.used {
        return Err(BuildError::ContextFull {
            n_ctx: cparams.n_ctx,
            used: kv.used,
            n_tokens: batch.n_tokens,
        });
    }

    Ok(())
}

fn rope_params(hparams: &Hparams, cparams: &ContextParams) -> RopeParams {
    let rope = cparams.rope(hparams);
    RopeParams {
        n_rot: hparams.n_rot as i32,
        mode: ROPE_TYPE_NEOX,
        n_ctx: cparams.n_ctx as i32,
        n_ctx_orig: rope.n_ctx_orig as i32,
        freq_base: rope.freq_base,
        freq_scale: rope.freq_scale,
        ext_factor: cparams.yarn_ext_factor,
        attn_factor: cparams.yarn_attn_factor,
        beta_fast: cparams.yarn_beta_fast,
        beta_slow: cparams.yarn_beta_slow,
    }
}

/// Token path: gather embedding rows by id. Embedding path: use the rows
/// directly. Exactly one is taken per build.
fn build_inp_embd(
    gctx: &mut GraphContext,
    hparams: &Hparams,
    batch: &Batch,
    tok_embd: &WeightTensor,
) -> (TensorRef, Option<TensorRef>, Option<TensorRef>) {
    if batch.tokens.is_some() {
        let inp_tokens = gctx.new_tensor_1d(DType::I32, batch.n_tokens as usize);
        gctx.set_input(inp_tokens);
        let table = tok_embd.import(gctx);
        let inp_l = gctx.get_rows(table, inp_tokens);
        (inp_l, Some(inp_tokens), None)
    } else {
        let inp_embd =
            gctx.new_tensor_2d(DType::F32, hparams.n_embd as usize, batch.n_tokens as usize);
        gctx.set_input(inp_embd);
        (inp_embd, None, Some(inp_embd))
    }
}

fn build_inp_pos(gctx: &mut GraphContext, batch: &Batch) -> TensorRef {
    let inp_pos = gctx.new_tensor_1d(DType::I32, batch.n_tokens as usize);
    gctx.set_input(inp_pos);
    inp_pos
}

/// Mask for one head, broadcast to all heads by the attention op. The
/// width is the consulted cache window under causal attention and the
/// batch itself otherwise; rows are padded to the runtime's alignment.
fn build_inp_kq_mask(
    gctx: &mut GraphContext,
    cparams: &ContextParams,
    batch: &Batch,
    n_kv: u32,
) -> (TensorRef, TensorRef) {
    let n_tokens = batch.n_tokens as usize;
    let d0 = if cparams.causal_attn {
        n_kv as usize
    } else {
        n_tokens
    };
    let mask = gctx.new_tensor_2d(DType::F32, d0, pad_to(n_tokens, KQ_MASK_PAD));
    gctx.set_input(mask);
    let used = if cparams.flash_attn {
        gctx.cast(mask, DType::F16)
    } else {
        mask
    };
    (mask, used)
}

fn build_norm(
    gctx: &mut GraphContext,
    cur: TensorRef,
    eps: f32,
    w: &WeightTensor,
    b: Option<&WeightTensor>,
) -> TensorRef {
    let mut cur = gctx.norm(cur, eps);
    let w = w.import(gctx);
    cur = gctx.mul(cur, w);
    if let Some(b) = b {
        let b = b.import(gctx);
        cur = gctx.add(cur, b);
    }
    cur
}

/// Copy this step's K and V into their cache windows
#[allow(clippy::too_many_arguments)]
fn build_kv_store(
    gctx: &mut GraphContext,
    graph: &mut Graph,
    kv: &KvCache,
    k_cur: TensorRef,
    v_cur: TensorRef,
    n_tokens: u32,
    kv_head: u32,
    il: u32,
    n_embd_v_gqa: u32,
) {
    assert_eq!(
        gctx.node(v_cur).ne[..2],
        [n_embd_v_gqa as usize, n_tokens as usize],
        "v_cur does not match its cache window"
    );

    let (k_view, v_view) = kv.write_views(gctx, il, n_tokens, kv_head);

    let k_cpy = gctx.cpy(k_cur, k_view);
    graph.build_forward_expand(gctx, k_cpy);

    let v_src = if kv.v_trans {
        gctx.transpose(v_cur)
    } else {
        v_cur
    };
    let v_cpy = gctx.cpy(v_src, v_view);
    graph.build_forward_expand(gctx, v_cpy);
}

/// Attention over the cache window, then the output projection
#[allow(clippy::too_many_arguments)]
fn build_kqv(
    gctx: &mut GraphContext,
    graph: &mut Graph,
    hparams: &Hparams,
    cparams: &ContextParams,
    kv: &KvCache,
    layer: &Phi2Layer,
    q_cur: TensorRef,
    kq_mask: TensorRef,
    n_tokens: u32,
    n_kv: u32,
    kq_scale: f32,
    il: u32,
) -> TensorRef {
    let n_head = hparams.n_head as usize;
    let n_head_kv = hparams.n_head_kv;
    let n_embd_head_k = hparams.n_embd_head_k;
    let n_embd_head_v = hparams.n_embd_head_v as usize;

    let q = gctx.permute(q_cur, 0, 2, 1, 3);
    let k = kv.read_k_view(gctx, il, n_kv, n_embd_head_k, n_head_kv);

    let mut cur = if cparams.flash_attn {
        let v = kv.read_v_view(gctx, il, n_kv, hparams.n_embd_head_v, n_head_kv);
        let attn = gctx.flash_attn_ext(q, k, v, kq_mask, kq_scale, hparams.f_max_alibi_bias);
        // Half-precision accumulation produces NaNs on this architecture.
        gctx.flash_attn_ext_set_prec(attn, Precision::F32);
        gctx.reshape_2d(attn, n_embd_head_v * n_head, n_tokens as usize)
    } else {
        let kq = gctx.mul_mat(k, q);
        // Half-precision accumulation produces NaNs on this architecture.
        gctx.mul_mat_set_prec(kq, Precision::F32);
        let kq = gctx.soft_max_ext(kq, Some(kq_mask), kq_scale, hparams.f_max_alibi_bias);
        let v = kv.read_v_view(gctx, il, n_kv, hparams.n_embd_head_v, n_head_kv);
        let kqv = gctx.mul_mat(v, kq);
        let kqv_merged = gctx.permute(kqv, 0, 2, 1, 3);
        gctx.cont_2d(kqv_merged, n_embd_head_v * n_head, n_tokens as usize)
    };
    graph.build_forward_expand(gctx, cur);

    let wo = layer.wo.import(gctx);
    cur = gctx.mul_mat(wo, cur);
    if let Some(bo) = &layer.bo {
        let bo = bo.import(gctx);
        cur = gctx.add(cur, bo);
    }
    cur
}

/// Pin Q/K/V materialization, store K/V, then attend
#[allow(clippy::too_many_arguments)]
fn build_kv(
    gctx: &mut GraphContext,
    graph: &mut Graph,
    hparams: &Hparams,
    cparams: &ContextParams,
    kv: &KvCache,
    layer: &Phi2Layer,
    k_cur: TensorRef,
    v_cur: TensorRef,
    q_cur: TensorRef,
    kq_mask: TensorRef,
    n_tokens: u32,
    kv_head: u32,
    n_kv: u32,
    kq_scale: f32,
    il: u32,
) -> TensorRef {
    // Added to the graph together so the scheduler cannot reorder them
    // against the cache writes below.
    graph.build_forward_expand(gctx, q_cur);
    graph.build_forward_expand(gctx, k_cur);
    graph.build_forward_expand(gctx, v_cur);

    build_kv_store(
        gctx,
        graph,
        kv,
        k_cur,
        v_cur,
        n_tokens,
        kv_head,
        il,
        hparams.n_embd_v_gqa(),
    );

    build_kqv(
        gctx, graph, hparams, cparams, kv, layer, q_cur, kq_mask, n_tokens, n_kv, kq_scale, il,
    )
}

fn build_inp_out_ids(gctx: &mut GraphContext, n_outputs: u32) -> TensorRef {
    let inp_out_ids = gctx.new_tensor_1d(DType::I32, n_outputs as usize);
    gctx.set_input(inp_out_ids);
    inp_out_ids
}

/// Feed-forward block: `down(act(up(x) [+ up_b]) [* gate]) [+ down_b]`
#[allow(clippy::too_many_arguments)]
fn build_ffn(
    gctx: &mut GraphContext,
    cur: TensorRef,
    up: &WeightTensor,
    up_b: Option<&WeightTensor>,
    gate: Option<&WeightTensor>,
    gate_b: Option<&WeightTensor>,
    down: &WeightTensor,
    down_b: Option<&WeightTensor>,
    act_scales: Option<TensorRef>,
    activation: FfnActivation,
    gate_type: FfnGate,
) -> TensorRef {
    let up_w = up.import(gctx);
    let mut tmp = gctx.mul_mat(up_w, cur);
    if let Some(up_b) = up_b {
        let up_b = up_b.import(gctx);
        tmp = gctx.add(tmp, up_b);
    }

    let mut out = match gate {
        Some(gate) => {
            let gate_w = gate.import(gctx);
            let mut gated = match gate_type {
                FfnGate::Sequential => gctx.mul_mat(gate_w, tmp),
                FfnGate::Parallel => gctx.mul_mat(gate_w, cur),
            };
            if let Some(gate_b) = gate_b {
                let gate_b = gate_b.import(gctx);
                gated = gctx.add(gated, gate_b);
            }
            gated
        }
        None => tmp,
    };

    out = match activation {
        FfnActivation::Silu => gctx.silu(out),
        FfnActivation::Gelu => {
            let mut act = gctx.gelu(out);
            if let Some(scales) = act_scales {
                act = gctx.div(act, scales);
            }
            act
        }
        FfnActivation::Relu => gctx.relu(out),
        FfnActivation::ReluSqr => {
            let r = gctx.relu(out);
            gctx.sqr(r)
        }
    };

    if gate.is_some() && gate_type == FfnGate::Parallel {
        out = gctx.mul(out, tmp);
    }

    let down_w = down.import(gctx);
    out = gctx.mul_mat(down_w, out);
    if let Some(down_b) = down_b {
        let down_b = down_b.import(gctx);
        out = gctx.add(out, down_b);
    }
    out
}

/// Build one forward pass over the decoder stack
///
/// Emits cache writes for the step and the logits tensor as sinks, then
/// returns the expanded graph with its input handles. The cache's write
/// cursor is not advanced; callers commit it after the runtime executes
/// the graph.
///
/// # Errors
///
/// [`ConfigError::CtxMismatch`] (through [`BuildError::Config`]) when the
/// cache capacity disagrees with the session context length, and
/// [`BuildError::InvalidBatch`] / [`BuildError::ContextFull`] for batch
/// invariant violations. Nothing is emitted on any error path.
///
/// # Panics
///
/// Panics on hyperparameter states that cannot come from a loaded model
/// (`n_embd_head_k * n_head != n_embd`), on graph capacity overflow, and
/// on internal shape inconsistencies; these are programming defects, not
/// input conditions.
pub fn build_phi2(gctx: &mut GraphContext, bctx: &mut BuildCtx) -> Result<Phi2Graph, BuildError> {
    validate(bctx)?;

    let model = bctx.model;
    let hparams = &model.hparams;
    let cparams = bctx.cparams;
    let batch = bctx.batch;

    let n_layer = hparams.n_layer;
    let n_embd = hparams.n_embd as usize;
    let n_head = hparams.n_head as usize;
    let n_head_kv = hparams.n_head_kv as usize;
    let n_embd_head = hparams.n_embd_head_v as usize;
    let n_embd_gqa = hparams.n_embd_v_gqa() as usize;
    let n_tokens = batch.n_tokens;
    assert_eq!(
        n_embd_head * n_head,
        n_embd,
        "head geometry does not cover the embedding width"
    );

    let kv_head = bctx.kv.prepare(n_tokens);
    let n_kv = bctx.kv.n;
    let rope = rope_params(hparams, cparams);
    let kq_scale = 1.0;

    let mut graph = Graph::new(GRAPH_MAX_NODES);

    let (mut inp_l, inp_tokens, inp_embd) = build_inp_embd(gctx, hparams, batch, &model.tok_embd);
    bctx.observer.on_tensor(inp_l, "inp_embd", -1);

    let inp_pos = build_inp_pos(gctx, batch);
    bctx.observer.on_tensor(inp_pos, "inp_pos", -1);

    let (kq_mask_input, kq_mask) = build_inp_kq_mask(gctx, cparams, batch, n_kv);
    bctx.observer.on_tensor(kq_mask, "KQ_mask", -1);

    let mut out_ids = None;

    for il in 0..n_layer {
        let layer = &model.layers[il as usize];

        let mut attn_norm_output = build_norm(
            gctx,
            inp_l,
            hparams.f_norm_eps,
            &layer.attn_norm,
            layer.attn_norm_b.as_ref(),
        );
        bctx.observer.on_tensor(attn_norm_output, "attn_norm", il as i32);

        // Self-attention
        let mut cur;
        {
            let (q_cur, k_cur, v_cur) = match &layer.qkv {
                QkvWeights::Fused { wqkv, bqkv } => {
                    let wqkv = wqkv.import(gctx);
                    cur = gctx.mul_mat(wqkv, attn_norm_output);
                    bctx.observer.on_tensor(cur, "wqkv", il as i32);
                    if let Some(bqkv) = bqkv {
                        let bqkv = bqkv.import(gctx);
                        cur = gctx.add(cur, bqkv);
                        bctx.observer.on_tensor(cur, "bqkv", il as i32);
                    }

                    // Contiguous Q | K | V split of the fused projection.
                    let nb1 = gctx.node(cur).nb[1];
                    let es = DType::F32.element_size();
                    let q = gctx.view_2d(cur, n_embd, n_tokens as usize, nb1, 0);
                    let q = gctx.cont(q);
                    let k = gctx.view_2d(cur, n_embd_gqa, n_tokens as usize, nb1, es * n_embd);
                    let k = gctx.cont(k);
                    let v = gctx.view_2d(
                        cur,
                        n_embd_gqa,
                        n_tokens as usize,
                        nb1,
                        es * (n_embd + n_embd_gqa),
                    );
                    let v = gctx.cont(v);
                    (q, k, v)
                }
                QkvWeights::Split {
                    wq,
                    bq,
                    wk,
                    bk,
                    wv,
                    bv,
                } => {
                    let mut project = |w: &WeightTensor, b: &Option<WeightTensor>| {
                        let w = w.import(gctx);
                        let mut p = gctx.mul_mat(w, attn_norm_output);
                        if let Some(b) = b {
                            let b = b.import(gctx);
                            p = gctx.add(p, b);
                        }
                        p
                    };
                    (project(wq, bq), project(wk, bk), project(wv, bv))
                }
            };

            let q_cur = gctx.reshape_3d(q_cur, n_embd_head, n_head, n_tokens as usize);
            let k_cur = gctx.reshape_3d(k_cur, n_embd_head, n_head_kv, n_tokens as usize);

            let q_cur = gctx.rope_ext(q_cur, inp_pos, None, rope);
            // Scaling Q ahead of attention keeps the softmax inputs inside
            // half-precision range.
            let q_cur = gctx.scale(q_cur, 1.0 / (n_embd_head as f32).sqrt());
            bctx.observer.on_tensor(q_cur, "Qcur", il as i32);

            let k_cur = gctx.rope_ext(k_cur, inp_pos, None, rope);
            bctx.observer.on_tensor(k_cur, "Kcur", il as i32);
            bctx.observer.on_tensor(v_cur, "Vcur", il as i32);

            cur = build_kv(
                gctx, &mut graph, hparams, cparams, bctx.kv, layer, k_cur, v_cur, q_cur, kq_mask,
                n_tokens, kv_head, n_kv, kq_scale, il,
            );
            bctx.observer.on_tensor(cur, "kqv_out", il as i32);
        }

        if il == n_layer - 1 {
            // Downstream ops compute only the selected output rows.
            let ids = build_inp_out_ids(gctx, bctx.n_outputs);
            out_ids = Some(ids);
            cur = gctx.get_rows(cur, ids);
            inp_l = gctx.get_rows(inp_l, ids);
            attn_norm_output = gctx.get_rows(attn_norm_output, ids);
        }

        let ffn_output = build_ffn(
            gctx,
            attn_norm_output,
            &layer.ffn_up,
            layer.ffn_up_b.as_ref(),
            None,
            None,
            &layer.ffn_down,
            layer.ffn_down_b.as_ref(),
            None,
            FfnActivation::Gelu,
            FfnGate::Sequential,
        );
        bctx.observer.on_tensor(ffn_output, "ffn_out", il as i32);

        // Attention and FFN both read the pre-norm output and sum with the
        // layer input: parallel residuals.
        cur = gctx.add(cur, ffn_output);
        cur = gctx.add(cur, inp_l);
        bctx.observer.on_tensor(cur, "l_out", il as i32);
        inp_l = cur;
    }

    let mut cur = build_norm(
        gctx,
        inp_l,
        hparams.f_norm_eps,
        &model.output_norm,
        model.output_norm_b.as_ref(),
    );
    bctx.observer.on_tensor(cur, "result_norm", -1);

    let output = model.output.import(gctx);
    cur = gctx.mul_mat(output, cur);
    if let Some(output_b) = &model.output_b {
        let output_b = output_b.import(gctx);
        cur = gctx.add(cur, output_b);
    }
    bctx.observer.on_tensor(cur, "result_output", -1);
    graph.build_forward_expand(gctx, cur);

    Ok(Phi2Graph {
        graph,
        inputs: GraphInputs {
            tokens: inp_tokens,
            embd: inp_embd,
            pos: inp_pos,
            kq_mask: kq_mask_input,
            out_ids,
        },
        logits: cur,
    })
}

/// Build the pre-step K rotation that re-bases cached keys after sequence
/// positions shift
///
/// Each layer's cached K is viewed head-by-head across every slot, rotated
/// by the per-slot deltas in the `k_shift` input, and copied back in
/// place. Runs before the next forward pass whenever the cache reports
/// [`CacheState::ShiftPending`](crate::kv_cache::CacheState::ShiftPending);
/// callers clear the flag once the graph has executed.
///
/// # Errors
///
/// [`ConfigError::CtxMismatch`] when the cache capacity disagrees with the
/// session context length.
pub fn build_k_shift(
    gctx: &mut GraphContext,
    model: &Model,
    cparams: &ContextParams,
    kv: &KvCache,
) -> Result<KShiftGraph, BuildError> {
    if kv.size != cparams.n_ctx {
        return Err(ConfigError::CtxMismatch {
            n_ctx: cparams.n_ctx,
            kv_size: kv.size,
        }
        .into());
    }

    let hparams = &model.hparams;
    let n_ctx = cparams.n_ctx as usize;
    let rope = rope_params(hparams, cparams);

    let mut graph = Graph::new(GRAPH_MAX_NODES);

    let k_shift = gctx.new_tensor_1d(DType::I32, n_ctx);
    gctx.set_input(k_shift);

    for il in 0..hparams.n_layer {
        let k = kv.k_shift_view(gctx, il, hparams.n_embd_head_k, hparams.n_head_kv);
        let rotated = gctx.rope_ext(k, k_shift, None, rope);
        let back = gctx.cpy(rotated, k);
        graph.build_forward_expand(gctx, back);
    }

    Ok(KShiftGraph { graph, k_shift })
}
