//! Dataflow graph arena and operator interface
//!
//! A forward pass is described as a DAG of tensor nodes inside a
//! [`GraphContext`] arena. Operators append nodes and return opaque
//! [`TensorRef`] handles; nothing is computed here. The external tensor
//! runtime walks the expanded [`Graph`] and executes it against buffers it
//! owns; this layer's job is exact bookkeeping of shapes, strides, byte
//! offsets, and precision overrides.
//!
//! Shape conventions follow GGML: `ne[0]` is the innermost (fastest
//! varying) dimension and `nb[i]` is the byte stride of dimension `i`.
//! Unused trailing dimensions are 1.

use std::collections::{HashMap, HashSet};

use crate::dtype::DType;

/// Number of tensor dimensions carried by every node
pub const MAX_DIMS: usize = 4;

/// Alignment the runtime requires for the batch dimension of KQ masks
pub const KQ_MASK_PAD: usize = 32;

/// Default node capacity for a decoder forward graph
pub const GRAPH_MAX_NODES: usize = 8192;

/// Round `x` up to a multiple of `n`
#[must_use]
pub fn pad_to(x: usize, n: usize) -> usize {
    x.div_ceil(n) * n
}

/// Opaque handle to a node in a [`GraphContext`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorRef(pub(crate) usize);

impl TensorRef {
    /// Arena index of this node
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Which half of the KV cache a slab node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheHalf {
    /// Key slab
    K,
    /// Value slab
    V,
}

/// Matmul / attention accumulation precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Runtime default (may accumulate in half precision)
    #[default]
    Default,
    /// Forced F32 accumulation
    F32,
}

/// Rotary position encoding parameters, passed through to the runtime op
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeParams {
    /// Number of rotated dimensions
    pub n_rot: i32,
    /// Rope mode; 2 selects NeoX interleaving
    pub mode: i32,
    /// Inference context length
    pub n_ctx: i32,
    /// Original trained context length for YaRN correction
    pub n_ctx_orig: i32,
    /// Frequency base
    pub freq_base: f32,
    /// Frequency scale
    pub freq_scale: f32,
    /// YaRN extrapolation mix factor
    pub ext_factor: f32,
    /// YaRN attention magnitude factor
    pub attn_factor: f32,
    /// YaRN low correction dim
    pub beta_fast: f32,
    /// YaRN high correction dim
    pub beta_slow: f32,
}

/// Operator performed by a node
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Freshly allocated tensor with no producer (inputs, scratch)
    Leaf,
    /// Model weight, bound by name at execution time
    Weight {
        /// Canonical tensor name in the weight container
        name: String,
    },
    /// Persistent per-layer KV cache slab, bound at execution time
    CacheSlab {
        /// Decoder layer index
        layer: u32,
        /// Key or value half
        half: CacheHalf,
    },
    /// Row gather: `dst[:, i] = src[:, ids[i]]`
    GetRows,
    /// Non-owning strided alias of another tensor
    View,
    /// Elementwise copy of source into a writable view
    Cpy,
    /// Materialize a contiguous copy
    Cont,
    /// Dimension permutation (alias, no data movement)
    Permute {
        /// Destination axis for each source axis
        axes: [usize; MAX_DIMS],
    },
    /// Shape change over contiguous data (alias)
    Reshape,
    /// Elementwise multiply with broadcast
    Mul,
    /// Elementwise add with broadcast
    Add,
    /// Matrix product
    MulMat,
    /// Multiply by a constant
    Scale {
        /// Constant factor
        factor: f32,
    },
    /// Elementwise divide
    Div,
    /// Elementwise square
    Sqr,
    /// LayerNorm without affine parameters
    Norm {
        /// Variance epsilon
        eps: f32,
    },
    /// RMSNorm
    RmsNorm {
        /// Variance epsilon
        eps: f32,
    },
    /// GELU activation
    Gelu,
    /// SiLU activation
    Silu,
    /// ReLU activation
    Relu,
    /// Element type conversion
    Cast,
    /// Extended rotary position encoding
    Rope(RopeParams),
    /// Fused scale + mask + softmax
    SoftMaxExt {
        /// Logit scale applied before the mask
        scale: f32,
        /// Maximum ALiBi bias; zero disables ALiBi slopes
        max_bias: f32,
    },
    /// Fused softmax-scaled dot-product attention
    FlashAttnExt {
        /// Logit scale
        scale: f32,
        /// Maximum ALiBi bias
        max_bias: f32,
    },
}

/// One node of the dataflow graph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Operator
    pub op: Op,
    /// Element type of the result
    pub dtype: DType,
    /// Dimensions, innermost first
    pub ne: [usize; MAX_DIMS],
    /// Byte strides per dimension
    pub nb: [usize; MAX_DIMS],
    /// Producing inputs
    pub srcs: Vec<TensorRef>,
    /// Root tensor when this node aliases another's storage
    pub view_src: Option<TensorRef>,
    /// Byte offset into the root's storage
    pub view_offs: usize,
    /// Marked as a graph input to be filled before execution
    pub is_input: bool,
    /// Accumulation precision override
    pub prec: Precision,
    /// Debug name assigned by the build observer
    pub name: Option<String>,
}

impl Node {
    /// Total element count
    #[must_use]
    pub fn n_elements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Whether the strides describe contiguous storage
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.nb == contiguous_strides(self.dtype, self.ne)
    }
}

fn contiguous_strides(dtype: DType, ne: [usize; MAX_DIMS]) -> [usize; MAX_DIMS] {
    let mut nb = [0usize; MAX_DIMS];
    nb[0] = dtype.type_size();
    nb[1] = dtype.row_size(ne[0]);
    for i in 2..MAX_DIMS {
        nb[i] = nb[i - 1] * ne[i - 1];
    }
    nb
}

fn dims4(dims: &[usize]) -> [usize; MAX_DIMS] {
    assert!(dims.len() <= MAX_DIMS, "too many dimensions: {dims:?}");
    let mut ne = [1usize; MAX_DIMS];
    ne[..dims.len()].copy_from_slice(dims);
    ne
}

// Broadcast compatibility: b can be repeated to a's shape.
fn can_repeat(a: &Node, b: &Node) -> bool {
    (0..MAX_DIMS).all(|i| b.ne[i] != 0 && a.ne[i] % b.ne[i] == 0)
}

/// Per-step arena of graph nodes
///
/// Acquired fresh for each forward pass and dropped afterwards together
/// with every handle it issued. Weight and cache-slab leaves are memoized
/// so that one build references each external tensor through one node.
#[derive(Default)]
pub struct GraphContext {
    nodes: Vec<Node>,
    weights: HashMap<String, TensorRef>,
    slabs: HashMap<(u32, CacheHalf), TensorRef>,
}

impl GraphContext {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the arena
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inspect a node
    #[must_use]
    pub fn node(&self, t: TensorRef) -> &Node {
        &self.nodes[t.0]
    }

    fn push(&mut self, node: Node) -> TensorRef {
        self.nodes.push(node);
        TensorRef(self.nodes.len() - 1)
    }

    fn leaf(&mut self, op: Op, dtype: DType, dims: &[usize]) -> TensorRef {
        let ne = dims4(dims);
        let nb = contiguous_strides(dtype, ne);
        self.push(Node {
            op,
            dtype,
            ne,
            nb,
            srcs: Vec::new(),
            view_src: None,
            view_offs: 0,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    fn unary(&mut self, op: Op, dtype: DType, dims: [usize; MAX_DIMS], src: TensorRef) -> TensorRef {
        let nb = contiguous_strides(dtype, dims);
        self.push(Node {
            op,
            dtype,
            ne: dims,
            nb,
            srcs: vec![src],
            view_src: None,
            view_offs: 0,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// New 1-D tensor
    pub fn new_tensor_1d(&mut self, dtype: DType, d0: usize) -> TensorRef {
        self.leaf(Op::Leaf, dtype, &[d0])
    }

    /// New 2-D tensor
    pub fn new_tensor_2d(&mut self, dtype: DType, d0: usize, d1: usize) -> TensorRef {
        self.leaf(Op::Leaf, dtype, &[d0, d1])
    }

    /// New 3-D tensor
    pub fn new_tensor_3d(&mut self, dtype: DType, d0: usize, d1: usize, d2: usize) -> TensorRef {
        self.leaf(Op::Leaf, dtype, &[d0, d1, d2])
    }

    /// Mark a tensor as a graph input the runtime must fill before running
    pub fn set_input(&mut self, t: TensorRef) {
        self.nodes[t.0].is_input = true;
    }

    /// Attach a debug name
    pub fn set_name(&mut self, t: TensorRef, name: &str) {
        self.nodes[t.0].name = Some(name.to_string());
    }

    /// Leaf for a model weight, memoized by name
    pub fn weight(&mut self, name: &str, dtype: DType, dims: &[usize]) -> TensorRef {
        if let Some(&t) = self.weights.get(name) {
            return t;
        }
        let t = self.leaf(
            Op::Weight {
                name: name.to_string(),
            },
            dtype,
            dims,
        );
        self.weights.insert(name.to_string(), t);
        t
    }

    /// Leaf for a persistent KV cache slab, memoized per layer and half
    ///
    /// Slabs are 1-D; all structure over them is imposed by views.
    pub fn cache_slab(
        &mut self,
        layer: u32,
        half: CacheHalf,
        dtype: DType,
        n_elements: usize,
    ) -> TensorRef {
        if let Some(&t) = self.slabs.get(&(layer, half)) {
            return t;
        }
        let t = self.leaf(Op::CacheSlab { layer, half }, dtype, &[n_elements]);
        self.slabs.insert((layer, half), t);
        t
    }

    /// Row gather: result column `i` is row `ids[i]` of `table`
    pub fn get_rows(&mut self, table: TensorRef, ids: TensorRef) -> TensorRef {
        assert_eq!(
            self.nodes[ids.0].dtype,
            DType::I32,
            "gather indices must be I32"
        );
        let table_ne = self.nodes[table.0].ne;
        let ids_ne = self.nodes[ids.0].ne;
        let dtype = if self.nodes[table.0].dtype == DType::I32 {
            DType::I32
        } else {
            DType::F32
        };
        let ne = [table_ne[0], ids_ne[0], ids_ne[1], 1];
        let nb = contiguous_strides(dtype, ne);
        self.push(Node {
            op: Op::GetRows,
            dtype,
            ne,
            nb,
            srcs: vec![table, ids],
            view_src: None,
            view_offs: 0,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    fn view_root(&self, t: TensorRef) -> (TensorRef, usize) {
        match self.nodes[t.0].view_src {
            Some(root) => (root, self.nodes[t.0].view_offs),
            None => (t, 0),
        }
    }

    fn push_view(
        &mut self,
        src: TensorRef,
        ne: [usize; MAX_DIMS],
        nb: [usize; MAX_DIMS],
        byte_offset: usize,
    ) -> TensorRef {
        let (root, base) = self.view_root(src);
        let dtype = self.nodes[src.0].dtype;
        let total = self.nodes[root.0].n_elements() * dtype.type_size() / dtype.block_size();
        // Furthest byte any index combination can touch.
        let extent: usize = (0..MAX_DIMS).map(|i| (ne[i] - 1) * nb[i]).sum::<usize>()
            + dtype.type_size();
        assert!(
            base + byte_offset + extent <= total,
            "view of {extent} bytes at offset {} exceeds {total}-byte tensor",
            base + byte_offset
        );
        self.push(Node {
            op: Op::View,
            dtype,
            ne,
            nb,
            srcs: vec![src],
            view_src: Some(root),
            view_offs: base + byte_offset,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// 1-D alias of `d0` elements starting `byte_offset` into `t`
    pub fn view_1d(&mut self, t: TensorRef, d0: usize, byte_offset: usize) -> TensorRef {
        let dtype = self.nodes[t.0].dtype;
        let ne = [d0, 1, 1, 1];
        let nb = contiguous_strides(dtype, ne);
        self.push_view(t, ne, nb, byte_offset)
    }

    /// 2-D alias with an explicit row stride `nb1`
    pub fn view_2d(
        &mut self,
        t: TensorRef,
        d0: usize,
        d1: usize,
        nb1: usize,
        byte_offset: usize,
    ) -> TensorRef {
        let dtype = self.nodes[t.0].dtype;
        let ne = [d0, d1, 1, 1];
        let nb = [dtype.type_size(), nb1, nb1 * d1, nb1 * d1];
        self.push_view(t, ne, nb, byte_offset)
    }

    /// 3-D alias with explicit strides `nb1`, `nb2`; `nb0` is implied by
    /// the element type
    #[allow(clippy::too_many_arguments)]
    pub fn view_3d(
        &mut self,
        t: TensorRef,
        d0: usize,
        d1: usize,
        d2: usize,
        nb1: usize,
        nb2: usize,
        byte_offset: usize,
    ) -> TensorRef {
        let dtype = self.nodes[t.0].dtype;
        let ne = [d0, d1, d2, 1];
        let nb = [dtype.type_size(), nb1, nb2, nb2 * d2];
        self.push_view(t, ne, nb, byte_offset)
    }

    /// Elementwise copy of `src` into the storage aliased by `dst`
    ///
    /// `dst` must alias a persistent tensor (a KV cache slab); the copy is
    /// how cache writes enter the graph.
    pub fn cpy(&mut self, src: TensorRef, dst: TensorRef) -> TensorRef {
        assert_eq!(
            self.nodes[src.0].n_elements(),
            self.nodes[dst.0].n_elements(),
            "cpy element count mismatch"
        );
        let (root, _) = self.view_root(dst);
        assert!(
            matches!(self.nodes[root.0].op, Op::CacheSlab { .. }),
            "cpy destination must alias a persistent cache tensor"
        );
        let dst_node = &self.nodes[dst.0];
        let (dtype, ne, nb, view_src, view_offs) = (
            dst_node.dtype,
            dst_node.ne,
            dst_node.nb,
            dst_node.view_src,
            dst_node.view_offs,
        );
        self.push(Node {
            op: Op::Cpy,
            dtype,
            ne,
            nb,
            srcs: vec![src, dst],
            view_src,
            view_offs,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// Materialize a contiguous copy
    pub fn cont(&mut self, t: TensorRef) -> TensorRef {
        let (dtype, ne) = (self.nodes[t.0].dtype, self.nodes[t.0].ne);
        self.unary(Op::Cont, dtype, ne, t)
    }

    /// Materialize a contiguous copy with a new 2-D shape
    pub fn cont_2d(&mut self, t: TensorRef, d0: usize, d1: usize) -> TensorRef {
        assert_eq!(
            self.nodes[t.0].n_elements(),
            d0 * d1,
            "cont_2d element count mismatch"
        );
        let dtype = self.nodes[t.0].dtype;
        self.unary(Op::Cont, dtype, [d0, d1, 1, 1], t)
    }

    /// Permute dimensions: source dimension `i` becomes `axes[i]`
    pub fn permute(
        &mut self,
        t: TensorRef,
        a0: usize,
        a1: usize,
        a2: usize,
        a3: usize,
    ) -> TensorRef {
        let axes = [a0, a1, a2, a3];
        {
            let mut seen = [false; MAX_DIMS];
            for &a in &axes {
                assert!(a < MAX_DIMS && !seen[a], "invalid permutation {axes:?}");
                seen[a] = true;
            }
        }
        let node = &self.nodes[t.0];
        let mut ne = [0usize; MAX_DIMS];
        let mut nb = [0usize; MAX_DIMS];
        for i in 0..MAX_DIMS {
            ne[axes[i]] = node.ne[i];
            nb[axes[i]] = node.nb[i];
        }
        let (dtype, view_src, view_offs) = (node.dtype, node.view_src, node.view_offs);
        self.push(Node {
            op: Op::Permute { axes },
            dtype,
            ne,
            nb,
            srcs: vec![t],
            view_src: view_src.or(Some(t)),
            view_offs,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// Swap the two innermost dimensions
    pub fn transpose(&mut self, t: TensorRef) -> TensorRef {
        self.permute(t, 1, 0, 2, 3)
    }

    fn reshape(&mut self, t: TensorRef, dims: &[usize]) -> TensorRef {
        let node = &self.nodes[t.0];
        assert!(node.is_contiguous(), "reshape requires contiguous input");
        let ne = dims4(dims);
        assert_eq!(
            node.n_elements(),
            ne.iter().product::<usize>(),
            "reshape element count mismatch"
        );
        let (dtype, view_src, view_offs) = (node.dtype, node.view_src, node.view_offs);
        let nb = contiguous_strides(dtype, ne);
        self.push(Node {
            op: Op::Reshape,
            dtype,
            ne,
            nb,
            srcs: vec![t],
            view_src: view_src.or(Some(t)),
            view_offs,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// Reshape to 2-D; the input must be contiguous
    pub fn reshape_2d(&mut self, t: TensorRef, d0: usize, d1: usize) -> TensorRef {
        self.reshape(t, &[d0, d1])
    }

    /// Reshape to 3-D; the input must be contiguous
    pub fn reshape_3d(&mut self, t: TensorRef, d0: usize, d1: usize, d2: usize) -> TensorRef {
        self.reshape(t, &[d0, d1, d2])
    }

    fn binary(&mut self, op: Op, a: TensorRef, b: TensorRef) -> TensorRef {
        assert!(
            can_repeat(&self.nodes[a.0], &self.nodes[b.0]),
            "operand {:?} does not broadcast over {:?}",
            self.nodes[b.0].ne,
            self.nodes[a.0].ne
        );
        let (dtype, ne) = (self.nodes[a.0].dtype, self.nodes[a.0].ne);
        let nb = contiguous_strides(dtype, ne);
        self.push(Node {
            op,
            dtype,
            ne,
            nb,
            srcs: vec![a, b],
            view_src: None,
            view_offs: 0,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// Elementwise multiply; `b` broadcasts over `a`
    pub fn mul(&mut self, a: TensorRef, b: TensorRef) -> TensorRef {
        self.binary(Op::Mul, a, b)
    }

    /// Elementwise add; `b` broadcasts over `a`
    pub fn add(&mut self, a: TensorRef, b: TensorRef) -> TensorRef {
        self.binary(Op::Add, a, b)
    }

    /// Elementwise divide; `b` broadcasts over `a`
    pub fn div(&mut self, a: TensorRef, b: TensorRef) -> TensorRef {
        self.binary(Op::Div, a, b)
    }

    /// Matrix product: `a` is `[k, m, ...]`, `b` is `[k, n, ...]`, the
    /// result is `[m, n, ...]` in F32; `a` broadcasts over the outer
    /// dimensions of `b` (grouped-query attention relies on this)
    pub fn mul_mat(&mut self, a: TensorRef, b: TensorRef) -> TensorRef {
        let (an, bn) = (&self.nodes[a.0], &self.nodes[b.0]);
        assert_eq!(
            an.ne[0], bn.ne[0],
            "mul_mat inner dims differ: {:?} x {:?}",
            an.ne, bn.ne
        );
        assert!(
            bn.ne[2] % an.ne[2] == 0 && bn.ne[3] % an.ne[3] == 0,
            "mul_mat outer dims do not broadcast: {:?} x {:?}",
            an.ne,
            bn.ne
        );
        let ne = [an.ne[1], bn.ne[1], bn.ne[2], bn.ne[3]];
        let nb = contiguous_strides(DType::F32, ne);
        self.push(Node {
            op: Op::MulMat,
            dtype: DType::F32,
            ne,
            nb,
            srcs: vec![a, b],
            view_src: None,
            view_offs: 0,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// Multiply every element by a constant
    pub fn scale(&mut self, t: TensorRef, factor: f32) -> TensorRef {
        let (dtype, ne) = (self.nodes[t.0].dtype, self.nodes[t.0].ne);
        self.unary(Op::Scale { factor }, dtype, ne, t)
    }

    /// Elementwise square
    pub fn sqr(&mut self, t: TensorRef) -> TensorRef {
        let (dtype, ne) = (self.nodes[t.0].dtype, self.nodes[t.0].ne);
        self.unary(Op::Sqr, dtype, ne, t)
    }

    /// LayerNorm over the innermost dimension, without affine parameters
    pub fn norm(&mut self, t: TensorRef, eps: f32) -> TensorRef {
        let ne = self.nodes[t.0].ne;
        self.unary(Op::Norm { eps }, DType::F32, ne, t)
    }

    /// RMSNorm over the innermost dimension
    pub fn rms_norm(&mut self, t: TensorRef, eps: f32) -> TensorRef {
        let ne = self.nodes[t.0].ne;
        self.unary(Op::RmsNorm { eps }, DType::F32, ne, t)
    }

    /// GELU activation
    pub fn gelu(&mut self, t: TensorRef) -> TensorRef {
        let (dtype, ne) = (self.nodes[t.0].dtype, self.nodes[t.0].ne);
        self.unary(Op::Gelu, dtype, ne, t)
    }

    /// SiLU activation
    pub fn silu(&mut self, t: TensorRef) -> TensorRef {
        let (dtype, ne) = (self.nodes[t.0].dtype, self.nodes[t.0].ne);
        self.unary(Op::Silu, dtype, ne, t)
    }

    /// ReLU activation
    pub fn relu(&mut self, t: TensorRef) -> TensorRef {
        let (dtype, ne) = (self.nodes[t.0].dtype, self.nodes[t.0].ne);
        self.unary(Op::Relu, dtype, ne, t)
    }

    /// Convert element type
    pub fn cast(&mut self, t: TensorRef, dtype: DType) -> TensorRef {
        let ne = self.nodes[t.0].ne;
        self.unary(Op::Cast, dtype, ne, t)
    }

    /// Extended rotary position encoding over the two innermost dims
    ///
    /// `pos` is an I32 tensor with one position per `t.ne[2]` slot.
    /// `freq_factors` optionally supplies per-dimension frequency scaling.
    pub fn rope_ext(
        &mut self,
        t: TensorRef,
        pos: TensorRef,
        freq_factors: Option<TensorRef>,
        params: RopeParams,
    ) -> TensorRef {
        assert_eq!(self.nodes[pos.0].dtype, DType::I32, "rope positions must be I32");
        assert_eq!(
            self.nodes[pos.0].ne[0],
            self.nodes[t.0].ne[2],
            "one position per token is required"
        );
        let (dtype, ne) = (self.nodes[t.0].dtype, self.nodes[t.0].ne);
        let nb = contiguous_strides(dtype, ne);
        let mut srcs = vec![t, pos];
        if let Some(ff) = freq_factors {
            srcs.push(ff);
        }
        self.push(Node {
            op: Op::Rope(params),
            dtype,
            ne,
            nb,
            srcs,
            view_src: None,
            view_offs: 0,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// Fused scale + mask + softmax over attention logits
    pub fn soft_max_ext(
        &mut self,
        kq: TensorRef,
        mask: Option<TensorRef>,
        scale: f32,
        max_bias: f32,
    ) -> TensorRef {
        if let Some(m) = mask {
            assert_eq!(
                self.nodes[m.0].ne[0],
                self.nodes[kq.0].ne[0],
                "mask width must match logit width"
            );
            assert!(
                self.nodes[m.0].ne[1] >= self.nodes[kq.0].ne[1],
                "mask must cover every query row"
            );
        }
        let ne = self.nodes[kq.0].ne;
        let nb = contiguous_strides(DType::F32, ne);
        let mut srcs = vec![kq];
        if let Some(m) = mask {
            srcs.push(m);
        }
        self.push(Node {
            op: Op::SoftMaxExt { scale, max_bias },
            dtype: DType::F32,
            ne,
            nb,
            srcs,
            view_src: None,
            view_offs: 0,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// Fused attention: `softmax(k^T q * scale + mask) v`
    ///
    /// The mask must be half precision. The result is
    /// `[n_embd_head_v, n_head, n_tokens, n_batch]` in F32.
    pub fn flash_attn_ext(
        &mut self,
        q: TensorRef,
        k: TensorRef,
        v: TensorRef,
        mask: TensorRef,
        scale: f32,
        max_bias: f32,
    ) -> TensorRef {
        let (qn, kn, vn) = (&self.nodes[q.0], &self.nodes[k.0], &self.nodes[v.0]);
        assert_eq!(qn.ne[0], kn.ne[0], "q/k head widths differ");
        assert_eq!(kn.ne[1], vn.ne[1], "k/v cover different kv lengths");
        assert_eq!(
            self.nodes[mask.0].dtype,
            DType::F16,
            "fused attention requires a half-precision mask"
        );
        let ne = [vn.ne[0], qn.ne[2], qn.ne[1], qn.ne[3]];
        let nb = contiguous_strides(DType::F32, ne);
        self.push(Node {
            op: Op::FlashAttnExt { scale, max_bias },
            dtype: DType::F32,
            ne,
            nb,
            srcs: vec![q, k, v, mask],
            view_src: None,
            view_offs: 0,
            is_input: false,
            prec: Precision::Default,
            name: None,
        })
    }

    /// Force F32 accumulation on a matmul node
    pub fn mul_mat_set_prec(&mut self, t: TensorRef, prec: Precision) {
        assert!(
            matches!(self.nodes[t.0].op, Op::MulMat),
            "precision override target is not a mul_mat"
        );
        self.nodes[t.0].prec = prec;
    }

    /// Force F32 accumulation on a fused attention node
    pub fn flash_attn_ext_set_prec(&mut self, t: TensorRef, prec: Precision) {
        assert!(
            matches!(self.nodes[t.0].op, Op::FlashAttnExt { .. }),
            "precision override target is not a fused attention"
        );
        self.nodes[t.0].prec = prec;
    }
}

/// An expanded forward graph: execution order plus registered sinks
///
/// Nodes enter the order through [`Graph::build_forward_expand`], which
/// walks a sink's ancestry depth-first and appends unseen nodes post-order,
/// so every node appears after everything it reads.
#[derive(Debug)]
pub struct Graph {
    max_nodes: usize,
    order: Vec<TensorRef>,
    sinks: Vec<TensorRef>,
    visited: HashSet<usize>,
}

impl Graph {
    /// Create a graph with a node capacity
    #[must_use]
    pub fn new(max_nodes: usize) -> Self {
        Self {
            max_nodes,
            order: Vec::new(),
            sinks: Vec::new(),
            visited: HashSet::new(),
        }
    }

    /// Register `sink` and everything it transitively reads
    pub fn build_forward_expand(&mut self, ctx: &GraphContext, sink: TensorRef) {
        self.visit(ctx, sink);
        if !self.sinks.contains(&sink) {
            self.sinks.push(sink);
        }
    }

    fn visit(&mut self, ctx: &GraphContext, t: TensorRef) {
        if self.visited.contains(&t.0) {
            return;
        }
        self.visited.insert(t.0);
        let (view_src, srcs) = {
            let node = ctx.node(t);
            (node.view_src, node.srcs.clone())
        };
        if let Some(root) = view_src {
            self.visit(ctx, root);
        }
        for src in srcs {
            self.visit(ctx, src);
        }
        assert!(
            self.order.len() < self.max_nodes,
            "graph exceeds {} nodes",
            self.max_nodes
        );
        self.order.push(t);
    }

    /// Nodes in execution order
    #[must_use]
    pub fn nodes(&self) -> &[TensorRef] {
        &self.order
    }

    /// Registered sinks, in registration order
    #[must_use]
    pub fn sinks(&self) -> &[TensorRef] {
        &self.sinks
    }

    /// Position of a node in the execution order
    #[must_use]
    pub fn position(&self, t: TensorRef) -> Option<usize> {
        self.order.iter().position(|&n| n == t)
    }

    /// Whether `t` was pulled into the graph
    #[must_use]
    pub fn contains(&self, t: TensorRef) -> bool {
        self.visited.contains(&t.0)
    }

    /// Snapshot of every node in execution order, for structural comparison
    #[must_use]
    pub fn summaries(&self, ctx: &GraphContext) -> Vec<Node> {
        self.order.iter().map(|&t| ctx.node(t).clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides_f32() {
        let mut ctx = GraphContext::new();
        let t = ctx.new_tensor_3d(DType::F32, 80, 32, 16);
        let node = ctx.node(t);
        assert_eq!(node.nb, [4, 320, 320 * 32, 320 * 32 * 16]);
        assert!(node.is_contiguous());
    }

    #[test]
    fn test_mul_mat_shape_and_dtype() {
        let mut ctx = GraphContext::new();
        let w = ctx.new_tensor_2d(DType::F16, 2560, 7680);
        let x = ctx.new_tensor_2d(DType::F32, 2560, 16);
        let y = ctx.mul_mat(w, x);
        assert_eq!(ctx.node(y).ne, [7680, 16, 1, 1]);
        assert_eq!(ctx.node(y).dtype, DType::F32);
    }

    #[test]
    fn test_mul_mat_gqa_broadcast() {
        let mut ctx = GraphContext::new();
        // 8 kv heads against 32 query heads
        let k = ctx.new_tensor_3d(DType::F16, 80, 128, 8);
        let q = ctx.new_tensor_3d(DType::F32, 80, 16, 32);
        let kq = ctx.mul_mat(k, q);
        assert_eq!(ctx.node(kq).ne, [128, 16, 32, 1]);
    }

    #[test]
    #[should_panic(expected = "inner dims differ")]
    fn test_mul_mat_mismatch_panics() {
        let mut ctx = GraphContext::new();
        let a = ctx.new_tensor_2d(DType::F32, 10, 4);
        let b = ctx.new_tensor_2d(DType::F32, 12, 4);
        let _ = ctx.mul_mat(a, b);
    }

    #[test]
    fn test_permute_rearranges_ne_and_nb() {
        let mut ctx = GraphContext::new();
        let q = ctx.new_tensor_3d(DType::F32, 80, 32, 16);
        let p = ctx.permute(q, 0, 2, 1, 3);
        let node = ctx.node(p);
        assert_eq!(node.ne, [80, 16, 32, 1]);
        // Strides travel with their dimensions.
        assert_eq!(node.nb[0], 4);
        assert_eq!(node.nb[2], 320);
        assert_eq!(node.view_src, Some(q));
    }

    #[test]
    fn test_transpose_is_dim_swap() {
        let mut ctx = GraphContext::new();
        let t = ctx.new_tensor_2d(DType::F32, 2560, 16);
        let tt = ctx.transpose(t);
        assert_eq!(ctx.node(tt).ne, [16, 2560, 1, 1]);
        assert!(!ctx.node(tt).is_contiguous());
    }

    #[test]
    fn test_reshape_preserves_elements() {
        let mut ctx = GraphContext::new();
        let t = ctx.new_tensor_2d(DType::F32, 2560, 16);
        let r = ctx.reshape_3d(t, 80, 32, 16);
        assert_eq!(ctx.node(r).n_elements(), 2560 * 16);
        assert!(ctx.node(r).is_contiguous());
    }

    #[test]
    fn test_view_1d_offset() {
        let mut ctx = GraphContext::new();
        let slab = ctx.cache_slab(0, CacheHalf::K, DType::F16, 2048 * 2560);
        let head = 16;
        let offset = DType::F16.row_size(2560) * head;
        let view = ctx.view_1d(slab, 16 * 2560, offset);
        assert_eq!(ctx.node(view).view_offs, offset);
        assert_eq!(ctx.node(view).view_src, Some(slab));
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_view_out_of_bounds_panics() {
        let mut ctx = GraphContext::new();
        let slab = ctx.cache_slab(0, CacheHalf::K, DType::F16, 1024);
        let _ = ctx.view_1d(slab, 1024, 2);
    }

    #[test]
    fn test_cpy_requires_cache_destination() {
        let mut ctx = GraphContext::new();
        let slab = ctx.cache_slab(3, CacheHalf::V, DType::F16, 4096);
        let dst = ctx.view_1d(slab, 256, 0);
        let src = ctx.new_tensor_1d(DType::F32, 256);
        let cpy = ctx.cpy(src, dst);
        assert_eq!(ctx.node(cpy).view_src, Some(slab));
    }

    #[test]
    #[should_panic(expected = "persistent cache tensor")]
    fn test_cpy_into_scratch_panics() {
        let mut ctx = GraphContext::new();
        let a = ctx.new_tensor_1d(DType::F32, 16);
        let b = ctx.new_tensor_1d(DType::F32, 16);
        let _ = ctx.cpy(a, b);
    }

    #[test]
    fn test_weight_and_slab_memoized() {
        let mut ctx = GraphContext::new();
        let w1 = ctx.weight("output.weight", DType::F16, &[64, 100]);
        let w2 = ctx.weight("output.weight", DType::F16, &[64, 100]);
        assert_eq!(w1, w2);
        let s1 = ctx.cache_slab(5, CacheHalf::K, DType::F16, 1024);
        let s2 = ctx.cache_slab(5, CacheHalf::K, DType::F16, 1024);
        assert_eq!(s1, s2);
        let s3 = ctx.cache_slab(5, CacheHalf::V, DType::F16, 1024);
        assert_ne!(s1, s3);
    }

    #[test]
    fn test_flash_attn_result_shape() {
        let mut ctx = GraphContext::new();
        let q = ctx.new_tensor_3d(DType::F32, 80, 16, 32); // permuted: [d, n_tokens, n_head]
        let k = ctx.new_tensor_3d(DType::F16, 80, 128, 32);
        let v = ctx.new_tensor_3d(DType::F16, 80, 128, 32);
        let mask = ctx.new_tensor_2d(DType::F16, 128, 32);
        let out = ctx.flash_attn_ext(q, k, v, mask, 1.0, 0.0);
        assert_eq!(ctx.node(out).ne, [80, 32, 16, 1]);
        assert_eq!(ctx.node(out).dtype, DType::F32);
    }

    #[test]
    #[should_panic(expected = "half-precision mask")]
    fn test_flash_attn_f32_mask_panics() {
        let mut ctx = GraphContext::new();
        let q = ctx.new_tensor_3d(DType::F32, 80, 16, 32);
        let k = ctx.new_tensor_3d(DType::F16, 80, 128, 32);
        let v = ctx.new_tensor_3d(DType::F16, 80, 128, 32);
        let mask = ctx.new_tensor_2d(DType::F32, 128, 32);
        let _ = ctx.flash_attn_ext(q, k, v, mask, 1.0, 0.0);
    }

    #[test]
    fn test_precision_override() {
        let mut ctx = GraphContext::new();
        let a = ctx.new_tensor_2d(DType::F32, 8, 4);
        let b = ctx.new_tensor_2d(DType::F32, 8, 4);
        let mm = ctx.mul_mat(a, b);
        assert_eq!(ctx.node(mm).prec, Precision::Default);
        ctx.mul_mat_set_prec(mm, Precision::F32);
        assert_eq!(ctx.node(mm).prec, Precision::F32);
    }

    #[test]
    #[should_panic(expected = "not a mul_mat")]
    fn test_precision_override_wrong_node_panics() {
        let mut ctx = GraphContext::new();
        let a = ctx.new_tensor_1d(DType::F32, 8);
        ctx.mul_mat_set_prec(a, Precision::F32);
    }

    #[test]
    fn test_expand_orders_ancestors_first() {
        let mut ctx = GraphContext::new();
        let a = ctx.new_tensor_2d(DType::F32, 8, 4);
        let b = ctx.new_tensor_2d(DType::F32, 8, 4);
        let mm = ctx.mul_mat(a, b);
        let out = ctx.gelu(mm);

        let mut graph = Graph::new(GRAPH_MAX_NODES);
        graph.build_forward_expand(&ctx, out);

        let pos = |t| graph.position(t).unwrap();
        assert!(pos(a) < pos(mm));
        assert!(pos(b) < pos(mm));
        assert!(pos(mm) < pos(out));
        assert_eq!(graph.sinks(), &[out]);
    }

    #[test]
    fn test_expand_deduplicates() {
        let mut ctx = GraphContext::new();
        let a = ctx.new_tensor_1d(DType::F32, 8);
        let g = ctx.gelu(a);
        let s = ctx.silu(a);

        let mut graph = Graph::new(GRAPH_MAX_NODES);
        graph.build_forward_expand(&ctx, g);
        graph.build_forward_expand(&ctx, s);
        // `a` appears once even though both sinks read it.
        assert_eq!(graph.nodes().iter().filter(|&&t| t == a).count(), 1);
        assert_eq!(graph.sinks().len(), 2);
    }

    #[test]
    #[should_panic(expected = "exceeds 2 nodes")]
    fn test_node_capacity_enforced() {
        let mut ctx = GraphContext::new();
        let a = ctx.new_tensor_1d(DType::F32, 8);
        let b = ctx.gelu(a);
        let c = ctx.silu(b);
        let mut graph = Graph::new(2);
        graph.build_forward_expand(&ctx, c);
    }

    #[test]
    fn test_pad_to() {
        assert_eq!(pad_to(16, 32), 32);
        assert_eq!(pad_to(32, 32), 32);
        assert_eq!(pad_to(33, 32), 64);
    }

    #[test]
    fn test_get_rows_shapes() {
        let mut ctx = GraphContext::new();
        let table = ctx.new_tensor_2d(DType::F16, 64, 100);
        let ids = ctx.new_tensor_1d(DType::I32, 16);
        let rows = ctx.get_rows(table, ids);
        assert_eq!(ctx.node(rows).ne, [64, 16, 1, 1]);
        assert_eq!(ctx.node(rows).dtype, DType::F32);
    }

    #[test]
    fn test_cast_changes_dtype_only() {
        let mut ctx = GraphContext::new();
        let mask = ctx.new_tensor_2d(DType::F32, 128, 32);
        let half = ctx.cast(mask, DType::F16);
        assert_eq!(ctx.node(half).ne, ctx.node(mask).ne);
        assert_eq!(ctx.node(half).dtype, DType::F16);
    }
}
