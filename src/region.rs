//! Disjoint-region decomposition (C1).
//!
//! Grounded on `original_source/common/utils/disjoint_layers.cpp`'s
//! `get_draw_regions`: given a front-to-back stack of layer rectangles,
//! produce the minimal set of non-overlapping rectangles such that every
//! output rectangle is covered by exactly the same subset of layers
//! throughout its area, then punch out the footprint of any layer already
//! committed to its own scan-out plane (`dedicated_layers`) and drop any
//! region under the cursor/overflow exclusion set (`exclude_layers`). The
//! original builds this by sweeping vertical "points of interest" (POIs) and
//! splitting on them; this module reaches the same disjoint partition by
//! compressing the x and y edges of every input rectangle into a grid and
//! tagging each cell with the layers that cover it, then merging adjacent
//! cells that carry an identical mask.
//!
//! Index convention: callers pass indices into `rects` in the same
//! front-to-back z-order used everywhere else in this crate (index 0 is
//! topmost, per [`crate::layer::OverlayLayer`]'s doc comment) — "a source
//! layer below a dedicated layer `d`" (spec.md §4.1) means a source index
//! numerically greater than `d`.

use smallvec::SmallVec;

use crate::geometry::Rect;

/// Bitmask of which input layers (by original index) cover a region.
///
/// A `u64` caps decomposition at 64 simultaneous layers, matching the
/// original's fixed-width layer mask and spec.md's assumption that overlay
/// layer counts stay well under hardware plane counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionMask(pub u64);

impl RegionMask {
    /// An empty mask, covered by nothing.
    pub const EMPTY: RegionMask = RegionMask(0);

    /// Sets bit `index`.
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < 64, "region engine supports at most 64 layers");
        self.0 |= 1 << index;
    }

    /// True if layer `index` covers this region.
    pub fn contains(&self, index: usize) -> bool {
        self.0 & (1 << index) != 0
    }

    /// True if no layer covers this region.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of layers covering this region.
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Index of the frontmost (lowest-index) layer covering this region, if any.
    pub fn frontmost(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Every original layer index set in this mask, ascending.
    pub fn indices(&self) -> Vec<usize> {
        let mut bits = self.0;
        let mut out = Vec::with_capacity(bits.count_ones() as usize);
        while bits != 0 {
            let b = bits.trailing_zeros() as usize;
            out.push(b);
            bits &= bits - 1;
        }
        out
    }
}

/// One rectangle of the decomposed output, tagged with the source layers
/// covering it (dedicated/excluded indices never appear here once
/// [`separate_layers`] has resolved a region, spec.md §3 `CompositionRegion`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositionRegion {
    /// the region's extent
    pub rect: Rect,
    /// which source layers cover this region, by original index
    pub mask: RegionMask,
}

/// Decomposes `source_layers` (indices into `rects`) into disjoint,
/// uniformly-covered regions, then applies `dedicated_layers` and
/// `exclude_layers` per spec.md §4.1:
///
/// - a region is discarded outright if it falls under any exclude rect;
/// - a region under a dedicated rect `d` has every source layer behind `d`
///   (numerically greater index) subtracted from its mask, since `d` is
///   opaque and already scanned out on its own plane;
/// - a region left with no source layers after subtraction is discarded.
///
/// If `source_layers.len() + dedicated_layers.len() + exclude_layers.len()`
/// would exceed the 64-layer mask width, `exclude_layers` is truncated (and
/// the truncation logged) rather than ever overflowing the bitmask.
pub fn separate_layers(rects: &[Rect], source_layers: &[usize], dedicated_layers: &[usize], exclude_layers: &[usize]) -> Vec<CompositionRegion> {
    let required = source_layers.len() + dedicated_layers.len();
    let mut exclude_layers = exclude_layers;
    let truncated_exclude: Vec<usize>;
    if required + exclude_layers.len() > 64 {
        let budget = 64usize.saturating_sub(required.min(64));
        tracing::warn!(dropped = exclude_layers.len().saturating_sub(budget), "region engine: truncating exclude rects to fit the 64-layer mask");
        truncated_exclude = exclude_layers[..budget.min(exclude_layers.len())].to_vec();
        exclude_layers = &truncated_exclude;
    }

    let mut included: Vec<usize> = source_layers.iter().chain(dedicated_layers.iter()).chain(exclude_layers.iter()).copied().collect();
    included.sort_unstable();
    included.dedup();
    included.truncate(64);

    let bit_of = |target: usize| included.iter().position(|i| *i == target);
    let bits_for = |indices: &[usize]| -> RegionMask {
        let mut m = RegionMask::EMPTY;
        for &idx in indices {
            if let Some(bit) = bit_of(idx) {
                m.set(bit);
            }
        }
        m
    };
    let source_bits = bits_for(source_layers);
    let dedicated_bits = bits_for(dedicated_layers);
    let exclude_bits = bits_for(exclude_layers);

    let mut xs: SmallVec<[i32; 32]> = SmallVec::new();
    let mut ys: SmallVec<[i32; 32]> = SmallVec::new();
    for &idx in &included {
        let r = rects[idx];
        if r.is_empty() {
            continue;
        }
        xs.push(r.x);
        xs.push(r.right());
        ys.push(r.y);
        ys.push(r.bottom());
    }
    xs.sort_unstable();
    xs.dedup();
    ys.sort_unstable();
    ys.dedup();

    if xs.len() < 2 || ys.len() < 2 {
        return Vec::new();
    }

    let cols = xs.len() - 1;
    let mut cells: Vec<CompositionRegion> = Vec::with_capacity(cols * (ys.len() - 1));
    for wy in ys.windows(2) {
        let (y0, y1) = (wy[0], wy[1]);
        for wx in xs.windows(2) {
            let (x0, x1) = (wx[0], wx[1]);
            let cell = Rect::new(x0, y0, x1 - x0, y1 - y0);
            let mut raw_mask = RegionMask::EMPTY;
            for (bit, &idx) in included.iter().enumerate() {
                let r = rects[idx];
                if !r.is_empty() && r.contains((x0, y0)) {
                    raw_mask.set(bit);
                }
            }
            let resolved = resolve_cell_mask(raw_mask, source_bits, dedicated_bits, exclude_bits);
            cells.push(CompositionRegion { rect: cell, mask: resolved });
        }
    }

    merge_runs(cells, cols).into_iter().map(|mut region| { region.mask = remap_to_original(region.mask, &included); region }).collect()
}

/// Resolves one grid cell's raw (bit-space) coverage mask into the mask it
/// should carry in the output: exclude-masked cells are dropped entirely,
/// dedicated-masked cells have their occluded sources subtracted.
fn resolve_cell_mask(raw: RegionMask, source_bits: RegionMask, dedicated_bits: RegionMask, exclude_bits: RegionMask) -> RegionMask {
    if raw.0 & exclude_bits.0 != 0 {
        return RegionMask::EMPTY;
    }
    let mut mask = raw.0 & source_bits.0;
    let mut dedicated_present = raw.0 & dedicated_bits.0;
    while dedicated_present != 0 {
        let d = dedicated_present.trailing_zeros();
        let behind_d = if d == 63 { 0 } else { !0u64 << (d + 1) };
        mask &= !(behind_d & source_bits.0);
        dedicated_present &= dedicated_present - 1;
    }
    RegionMask(mask)
}

/// Translates a bit-space mask (positions into `included`) back to the
/// original layer indices callers submitted.
fn remap_to_original(mask: RegionMask, included: &[usize]) -> RegionMask {
    let mut out = RegionMask::EMPTY;
    for bit in mask.indices() {
        out.set(included[bit]);
    }
    out
}

/// Merges horizontally-adjacent cells in each row that share a mask, then
/// merges vertically-adjacent rows that became identical after the
/// horizontal pass. Cells with an empty mask (covered by nothing, or
/// discarded per the exclude/dedicated rules above) are dropped.
fn merge_runs(cells: Vec<CompositionRegion>, cols: usize) -> Vec<CompositionRegion> {
    let rows = cells.len().checked_div(cols).unwrap_or(0);
    let mut row_merged: Vec<Vec<CompositionRegion>> = Vec::with_capacity(rows);

    for row in cells.chunks(cols) {
        let mut merged: Vec<CompositionRegion> = Vec::new();
        for region in row {
            if region.mask.is_empty() {
                continue;
            }
            if let Some(last) = merged.last_mut() {
                if last.mask == region.mask && last.rect.right() == region.rect.x && last.rect.y == region.rect.y
                    && last.rect.height == region.rect.height
                {
                    last.rect.width += region.rect.width;
                    continue;
                }
            }
            merged.push(*region);
        }
        row_merged.push(merged);
    }

    let mut out: Vec<CompositionRegion> = Vec::new();
    let mut carried: Vec<CompositionRegion> = Vec::new();
    for row in row_merged {
        let mut next_carried: Vec<CompositionRegion> = Vec::with_capacity(row.len());
        for region in row {
            if let Some(pos) = carried.iter().position(|c| {
                c.mask == region.mask && c.rect.x == region.rect.x && c.rect.width == region.rect.width
                    && c.rect.bottom() == region.rect.y
            }) {
                let mut grown = carried.remove(pos);
                grown.rect.height += region.rect.height;
                next_carried.push(grown);
            } else {
                next_carried.push(region);
            }
        }
        out.extend(carried);
        carried = next_carried;
    }
    out.extend(carried);
    out
}
