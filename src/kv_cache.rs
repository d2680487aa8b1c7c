//! Key/value cache manager
//!
//! Owns the logical per-layer K/V slabs that persist across forward
//! passes and hands the graph builder write windows and read views into
//! them. The cache itself never touches tensor data; mutation happens only
//! when the runtime executes the copy nodes the builder emits.
//!
//! K is stored row-major, one `n_embd_k_gqa`-wide row per cache slot. V is
//! stored the same way under flash attention, and transposed (one cache
//! column per value lane) otherwise, which is what the non-flash attention
//! matmul wants to read.

use crate::dtype::DType;
use crate::graph::{pad_to, CacheHalf, GraphContext, TensorRef, KQ_MASK_PAD};

/// Lifecycle state of the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Allocated, nothing stored yet
    Fresh,
    /// Holding live entries
    Active,
    /// Positions were rebased; a K rotation must run before the next step
    ShiftPending,
    /// Fragmentation crossed the threshold; compaction requested
    DefragPending,
    /// A state copy was requested
    CopyPending,
    /// Session over; the cache must not be consulted again
    Retired,
}

/// Per-layer key/value storage descriptor and step cursors
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Layer count
    n_layer: u32,
    /// Capacity in slots; equals the session context length
    pub size: u32,
    /// Write cursor: slot where the next step's entries land
    pub head: u32,
    /// Occupied slots across the longest sequence
    pub used: u32,
    /// Active window consulted this step, recomputed by [`KvCache::prepare`]
    pub n: u32,
    /// Element type of K
    pub type_k: DType,
    /// Element type of V
    pub type_v: DType,
    /// Whether V is stored transposed (true unless flash attention)
    pub v_trans: bool,
    /// Set when positions were rebased; cleared after the shift graph runs
    pub has_shift: bool,
    /// Set when fragmentation exceeded the threshold
    pub do_defrag: bool,
    /// Set when a pending state copy exists
    pub do_copy: bool,
    n_embd_k_gqa: u32,
    n_embd_v_gqa: u32,
    retired: bool,
}

impl KvCache {
    /// Allocate cache bookkeeping for a session
    ///
    /// `n_ctx` slots per layer; `v_trans` should be the negation of the
    /// session's `flash_attn`.
    #[must_use]
    pub fn new(
        n_layer: u32,
        n_ctx: u32,
        n_embd_k_gqa: u32,
        n_embd_v_gqa: u32,
        type_k: DType,
        type_v: DType,
        v_trans: bool,
    ) -> Self {
        Self {
            n_layer,
            size: n_ctx,
            head: 0,
            used: 0,
            n: 0,
            type_k,
            type_v,
            v_trans,
            has_shift: false,
            do_defrag: false,
            do_copy: false,
            n_embd_k_gqa,
            n_embd_v_gqa,
            retired: false,
        }
    }

    /// Allocate with the default half-precision element types
    #[must_use]
    pub fn with_defaults(n_layer: u32, n_ctx: u32, n_embd_k_gqa: u32, n_embd_v_gqa: u32, flash_attn: bool) -> Self {
        Self::new(
            n_layer,
            n_ctx,
            n_embd_k_gqa,
            n_embd_v_gqa,
            DType::F16,
            DType::F16,
            !flash_attn,
        )
    }

    /// Layer count the cache was allocated for
    #[must_use]
    pub fn n_layer(&self) -> u32 {
        self.n_layer
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> CacheState {
        if self.retired {
            CacheState::Retired
        } else if self.has_shift {
            CacheState::ShiftPending
        } else if self.do_defrag {
            CacheState::DefragPending
        } else if self.do_copy {
            CacheState::CopyPending
        } else if self.used == 0 && self.head == 0 {
            CacheState::Fresh
        } else {
            CacheState::Active
        }
    }

    /// Recompute the active window for a step of `n_tokens` and return the
    /// write cursor for that step
    ///
    /// The window is padded to the mask alignment so the mask the builder
    /// emits matches what the runtime expects to read.
    pub fn prepare(&mut self, n_tokens: u32) -> u32 {
        debug_assert!(!self.retired, "prepare on retired cache");
        let needed = (self.used + n_tokens) as usize;
        self.n = self
            .size
            .min(pad_to(needed.max(1), KQ_MASK_PAD) as u32)
            .max(KQ_MASK_PAD.min(self.size as usize) as u32);
        self.head
    }

    /// Commit a step: advance the write cursor past the stored tokens
    pub fn commit(&mut self, n_tokens: u32) {
        debug_assert!(self.head + n_tokens <= self.size, "cache overflow");
        self.head += n_tokens;
        self.used = self.used.max(self.head);
    }

    /// Record that sequence positions were rebased; the next step must be
    /// preceded by the K rotation graph
    pub fn rebase(&mut self) {
        self.has_shift = true;
    }

    /// Clear the shift flag after the rotation graph has executed
    pub fn shift_applied(&mut self) {
        self.has_shift = false;
    }

    /// Check the fragmentation fraction against the session threshold
    pub fn note_fragmentation(&mut self, fraction: f32, defrag_thold: f32) {
        if defrag_thold >= 0.0 && fraction > defrag_thold {
            self.do_defrag = true;
        }
    }

    /// Clear the defrag flag after compaction
    pub fn defrag_applied(&mut self) {
        self.do_defrag = false;
    }

    /// Drop all stored entries, keeping the allocation
    pub fn reset(&mut self) {
        self.head = 0;
        self.used = 0;
        self.n = 0;
        self.has_shift = false;
        self.do_defrag = false;
        self.do_copy = false;
    }

    /// Mark the session over
    pub fn retire(&mut self) {
        self.retired = true;
    }

    /// Elements in one layer's K slab
    #[must_use]
    pub fn k_slab_elements(&self) -> usize {
        self.n_embd_k_gqa as usize * self.size as usize
    }

    /// Elements in one layer's V slab
    #[must_use]
    pub fn v_slab_elements(&self) -> usize {
        self.n_embd_v_gqa as usize * self.size as usize
    }

    fn k_slab(&self, ctx: &mut GraphContext, layer: u32) -> TensorRef {
        debug_assert!(layer < self.n_layer);
        ctx.cache_slab(layer, CacheHalf::K, self.type_k, self.k_slab_elements())
    }

    fn v_slab(&self, ctx: &mut GraphContext, layer: u32) -> TensorRef {
        debug_assert!(layer < self.n_layer);
        ctx.cache_slab(layer, CacheHalf::V, self.type_v, self.v_slab_elements())
    }

    /// Write windows for one layer's step: `n_tokens` rows starting at
    /// slot `kv_head`
    ///
    /// K is a 1-D window of `n_tokens * n_embd_k_gqa` elements at byte
    /// offset `row_size(type_k, n_embd_k_gqa) * kv_head`. V is the same
    /// shape of window when V is stored row-major, and a strided 2-D
    /// `[n_tokens, n_embd_v_gqa]` window at element offset `kv_head`
    /// otherwise.
    pub fn write_views(
        &self,
        ctx: &mut GraphContext,
        layer: u32,
        n_tokens: u32,
        kv_head: u32,
    ) -> (TensorRef, TensorRef) {
        let n_tokens = n_tokens as usize;
        let k_gqa = self.n_embd_k_gqa as usize;
        let v_gqa = self.n_embd_v_gqa as usize;

        let k_slab = self.k_slab(ctx, layer);
        let k_view = ctx.view_1d(
            k_slab,
            n_tokens * k_gqa,
            self.type_k.row_size(k_gqa) * kv_head as usize,
        );

        let v_slab = self.v_slab(ctx, layer);
        let v_view = if self.v_trans {
            let es = self.type_v.element_size();
            ctx.view_2d(
                v_slab,
                n_tokens,
                v_gqa,
                self.size as usize * es,
                kv_head as usize * es,
            )
        } else {
            ctx.view_1d(
                v_slab,
                n_tokens * v_gqa,
                self.type_v.row_size(v_gqa) * kv_head as usize,
            )
        };

        (k_view, v_view)
    }

    /// Read view of one layer's keys: `[n_embd_head_k, n_kv, n_head_kv]`
    pub fn read_k_view(
        &self,
        ctx: &mut GraphContext,
        layer: u32,
        n_kv: u32,
        n_embd_head_k: u32,
        n_head_kv: u32,
    ) -> TensorRef {
        let k_slab = self.k_slab(ctx, layer);
        ctx.view_3d(
            k_slab,
            n_embd_head_k as usize,
            n_kv as usize,
            n_head_kv as usize,
            self.type_k.row_size(self.n_embd_k_gqa as usize),
            self.type_k.row_size(n_embd_head_k as usize),
            0,
        )
    }

    /// Head-by-head view of one layer's full K slab, for the pre-step
    /// rotation: `[n_embd_head_k, n_head_kv, n_ctx]`
    pub fn k_shift_view(
        &self,
        ctx: &mut GraphContext,
        layer: u32,
        n_embd_head_k: u32,
        n_head_kv: u32,
    ) -> TensorRef {
        let k_slab = self.k_slab(ctx, layer);
        ctx.view_3d(
            k_slab,
            n_embd_head_k as usize,
            n_head_kv as usize,
            self.size as usize,
            self.type_k.row_size(n_embd_head_k as usize),
            self.type_k.row_size(self.n_embd_k_gqa as usize),
            0,
        )
    }

    /// Read view of one layer's values, layout-dependent
    ///
    /// Row-major (flash): `[n_embd_head_v, n_kv, n_head_kv]` with the same
    /// stride pattern as K. Transposed: `[n_kv, n_embd_head_v, n_head_kv]`
    /// striding across cache columns.
    pub fn read_v_view(
        &self,
        ctx: &mut GraphContext,
        layer: u32,
        n_kv: u32,
        n_embd_head_v: u32,
        n_head_kv: u32,
    ) -> TensorRef {
        let v_slab = self.v_slab(ctx, layer);
        if self.v_trans {
            let es = self.type_v.element_size();
            let n_ctx = self.size as usize;
            ctx.view_3d(
                v_slab,
                n_kv as usize,
                n_embd_head_v as usize,
                n_head_kv as usize,
                es * n_ctx,
                es * n_ctx * n_embd_head_v as usize,
                0,
            )
        } else {
            ctx.view_3d(
                v_slab,
                n_embd_head_v as usize,
                n_kv as usize,
                n_head_kv as usize,
                self.type_v.row_size(self.n_embd_v_gqa as usize),
                self.type_v.row_size(n_embd_head_v as usize),
                0,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(flash: bool) -> KvCache {
        // Moondream text model geometry
        KvCache::with_defaults(32, 2048, 2560, 2560, flash)
    }

    #[test]
    fn test_fresh_cache_state() {
        let kv = cache(false);
        assert_eq!(kv.state(), CacheState::Fresh);
        assert_eq!(kv.size, 2048);
        assert!(kv.v_trans);
        assert_eq!(kv.type_k, DType::F16);
    }

    #[test]
    fn test_flash_cache_not_transposed() {
        let kv = cache(true);
        assert!(!kv.v_trans);
    }

    #[test]
    fn test_prepare_pads_window() {
        let mut kv = cache(false);
        let head = kv.prepare(16);
        assert_eq!(head, 0);
        assert_eq!(kv.n, 32);

        kv.commit(16);
        assert_eq!(kv.head, 16);
        assert_eq!(kv.used, 16);
        assert_eq!(kv.state(), CacheState::Active);

        // 17 occupied slots round up to the mask alignment
        kv.prepare(1);
        assert_eq!(kv.n, 32);

        kv.commit(1);
        let mut total = 17;
        while total + 16 <= 48 {
            kv.commit(16);
            total += 16;
        }
        kv.prepare(1);
        assert_eq!(kv.n, 64);
    }

    #[test]
    fn test_window_clamped_to_size() {
        let mut kv = KvCache::with_defaults(2, 64, 128, 128, false);
        kv.commit(64);
        kv.prepare(0);
        assert_eq!(kv.n, 64);
    }

    #[test]
    fn test_state_machine_flags() {
        let mut kv = cache(false);
        kv.commit(8);
        kv.rebase();
        assert_eq!(kv.state(), CacheState::ShiftPending);
        kv.shift_applied();
        assert_eq!(kv.state(), CacheState::Active);

        kv.note_fragmentation(0.5, 0.1);
        assert_eq!(kv.state(), CacheState::DefragPending);
        kv.defrag_applied();
        assert_eq!(kv.state(), CacheState::Active);

        // Negative threshold disables defrag entirely
        kv.note_fragmentation(0.9, -1.0);
        assert_eq!(kv.state(), CacheState::Active);

        kv.retire();
        assert_eq!(kv.state(), CacheState::Retired);
    }

    #[test]
    fn test_reset_keeps_allocation() {
        let mut kv = cache(false);
        kv.commit(100);
        kv.reset();
        assert_eq!(kv.state(), CacheState::Fresh);
        assert_eq!(kv.used, 0);
        assert_eq!(kv.k_slab_elements(), 2048 * 2560);
    }

    #[test]
    fn test_k_write_window_offset() {
        let kv = cache(false);
        let mut ctx = GraphContext::new();
        let (k_view, _) = kv.write_views(&mut ctx, 0, 16, 16);
        let node = ctx.node(k_view);
        assert_eq!(node.ne[0], 16 * 2560);
        assert_eq!(node.view_offs, DType::F16.row_size(2560) * 16);
    }

    #[test]
    fn test_v_write_window_transposed() {
        let kv = cache(false);
        let mut ctx = GraphContext::new();
        let (_, v_view) = kv.write_views(&mut ctx, 0, 16, 16);
        let node = ctx.node(v_view);
        assert_eq!(node.ne[0], 16);
        assert_eq!(node.ne[1], 2560);
        // Row stride crosses the whole context, offset is per element.
        assert_eq!(node.nb[1], 2048 * 2);
        assert_eq!(node.view_offs, 16 * 2);
    }

    #[test]
    fn test_v_write_window_flash() {
        let kv = cache(true);
        let mut ctx = GraphContext::new();
        let (k_view, v_view) = kv.write_views(&mut ctx, 4, 8, 8);
        assert_eq!(ctx.node(v_view).ne[0], 8 * 2560);
        assert_eq!(ctx.node(v_view).view_offs, DType::F16.row_size(2560) * 8);
        assert_eq!(ctx.node(k_view).view_offs, ctx.node(v_view).view_offs);
    }

    #[test]
    fn test_k_read_view_strides() {
        let kv = cache(false);
        let mut ctx = GraphContext::new();
        let k = kv.read_k_view(&mut ctx, 3, 32, 80, 32);
        let node = ctx.node(k);
        assert_eq!(node.ne, [80, 32, 32, 1]);
        assert_eq!(node.nb[1], DType::F16.row_size(2560));
        assert_eq!(node.nb[2], DType::F16.row_size(80));
        assert_eq!(node.view_offs, 0);
    }

    #[test]
    fn test_v_read_view_transposed_strides() {
        let kv = cache(false);
        let mut ctx = GraphContext::new();
        let v = kv.read_v_view(&mut ctx, 3, 32, 80, 32);
        let node = ctx.node(v);
        assert_eq!(node.ne, [32, 80, 32, 1]);
        assert_eq!(node.nb[1], 2 * 2048);
        assert_eq!(node.nb[2], 2 * 2048 * 80);
    }

    #[test]
    fn test_v_read_view_flash_matches_k_pattern() {
        let kv = cache(true);
        let mut ctx = GraphContext::new();
        let v = kv.read_v_view(&mut ctx, 3, 32, 80, 32);
        let k = kv.read_k_view(&mut ctx, 3, 32, 80, 32);
        assert_eq!(ctx.node(v).ne, ctx.node(k).ne);
        assert_eq!(ctx.node(v).nb, ctx.node(k).nb);
    }

    #[test]
    fn test_write_views_share_slab_with_read_views() {
        let kv = cache(false);
        let mut ctx = GraphContext::new();
        let (k_w, v_w) = kv.write_views(&mut ctx, 0, 16, 0);
        let k_r = kv.read_k_view(&mut ctx, 0, 32, 80, 32);
        let v_r = kv.read_v_view(&mut ctx, 0, 32, 80, 32);
        assert_eq!(ctx.node(k_w).view_src, ctx.node(k_r).view_src);
        assert_eq!(ctx.node(v_w).view_src, ctx.node(v_r).view_src);
        assert_ne!(ctx.node(k_w).view_src, ctx.node(v_w).view_src);
    }
}
