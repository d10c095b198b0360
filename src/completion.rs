//! Authoritative accounting of which blocks and pieces we own.
//!
//! `Completion` tracks ownership at block granularity and derives the
//! byte totals the announcer, RPC layer, and progress display ask for.
//! The two expensive derivations (`size_when_done`, `has_valid`) are
//! memoized and selectively invalidated by the mutators.

use std::cell::Cell;

use crate::bitfield::Bitfield;
use crate::blocks::{BlockInfo, BlockSpan};

/// How far along a torrent is, as the tracker protocol distinguishes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// Doesn't have all wanted pieces.
    Leech,
    /// Has all wanted pieces, but not all pieces.
    PartialSeed,
    /// Has every piece.
    Seed,
}

/// File-priority view supplied by the torrent: which pieces are wanted.
pub trait WantedPieces {
    fn piece_is_wanted(&self, piece: u32) -> bool;
}

/// Every piece wanted; the common case and the default for tests.
pub struct AllWanted;

impl WantedPieces for AllWanted {
    fn piece_is_wanted(&self, _piece: u32) -> bool {
        true
    }
}

pub struct Completion {
    info: BlockInfo,
    blocks: Bitfield,
    size_now: u64,
    size_when_done: Cell<Option<u64>>,
    has_valid: Cell<Option<u64>>,
}

impl Completion {
    pub fn new(info: BlockInfo) -> Self {
        let blocks = Bitfield::new(info.block_count() as usize);
        Self {
            info,
            blocks,
            size_now: 0,
            size_when_done: Cell::new(None),
            has_valid: Cell::new(None),
        }
    }

    pub fn info(&self) -> &BlockInfo {
        &self.info
    }

    pub fn blocks(&self) -> &Bitfield {
        &self.blocks
    }

    pub fn has_all(&self) -> bool {
        self.blocks.has_all()
    }

    pub fn has_none(&self) -> bool {
        self.blocks.has_none()
    }

    pub fn has_block(&self, block: u64) -> bool {
        self.blocks.has(block as usize)
    }

    pub fn has_blocks(&self, span: BlockSpan) -> bool {
        self.blocks.count(span.begin as usize, span.end as usize) == span.len() as usize
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.count_missing_blocks_in_piece(piece) == 0
    }

    /// Bytes we possess, at block granularity.
    pub fn has_total(&self) -> u64 {
        self.size_now
    }

    /// Bytes of verified data (sum of owned piece sizes).
    pub fn has_valid(&self) -> u64 {
        if let Some(cached) = self.has_valid.get() {
            return cached;
        }
        let mut size = 0;
        for piece in 0..self.info.piece_count() {
            if self.has_piece(piece) {
                size += self.info.piece_size(piece) as u64;
            }
        }
        self.has_valid.set(Some(size));
        size
    }

    /// Bytes we'll have when every wanted piece is complete.
    pub fn size_when_done(&self, wanted: &dyn WantedPieces) -> u64 {
        if let Some(cached) = self.size_when_done.get() {
            return cached;
        }

        let size = if self.has_all() {
            self.info.total_size()
        } else {
            // wanted pieces count in full; unwanted ones only for what we
            // already happen to hold
            let mut size = 0;
            for piece in 0..self.info.piece_count() {
                if wanted.piece_is_wanted(piece) {
                    size += self.info.piece_size(piece) as u64;
                } else {
                    size += self.count_has_bytes_in_blocks(self.info.block_span_for_piece(piece));
                }
            }
            size
        };

        self.size_when_done.set(Some(size));
        size
    }

    pub fn left_until_done(&self, wanted: &dyn WantedPieces) -> u64 {
        self.size_when_done(wanted) - self.has_total()
    }

    pub fn status(&self, wanted: &dyn WantedPieces) -> Completeness {
        if self.has_all() {
            Completeness::Seed
        } else if self.size_now == self.size_when_done(wanted) {
            Completeness::PartialSeed
        } else {
            Completeness::Leech
        }
    }

    /// Fraction complete per tab, for progress bars: blocks are split into
    /// `n_tabs` equal ranges and each reports its own completion ratio.
    pub fn amount_done(&self, n_tabs: usize) -> Vec<f32> {
        if n_tabs == 0 {
            return Vec::new();
        }

        let n_blocks = self.blocks.len();
        let blocks_per_tab = n_blocks / n_tabs;
        let mut tabs = Vec::with_capacity(n_tabs);
        for i in 0..n_tabs {
            let begin = i * blocks_per_tab;
            let end = (begin + blocks_per_tab).min(n_blocks);
            if end <= begin {
                tabs.push(0.0);
            } else {
                tabs.push(self.blocks.count(begin, end) as f32 / (end - begin) as f32);
            }
        }
        tabs
    }

    pub fn count_missing_blocks_in_piece(&self, piece: u32) -> u64 {
        let span = self.info.block_span_for_piece(piece);
        span.len() - self.blocks.count(span.begin as usize, span.end as usize) as u64
    }

    pub fn count_missing_bytes_in_piece(&self, piece: u32) -> u64 {
        self.info.piece_size(piece) as u64
            - self.count_has_bytes_in_blocks(self.info.block_span_for_piece(piece))
    }

    fn count_has_bytes_in_blocks(&self, span: BlockSpan) -> u64 {
        let mut n = self.blocks.count(span.begin as usize, span.end as usize) as u64;
        n *= crate::blocks::BLOCK_SIZE as u64;

        // the final block may be short
        if span.end == self.info.block_count() && self.blocks.has(span.end as usize - 1) {
            n -= (crate::blocks::BLOCK_SIZE - self.info.final_block_size()) as u64;
        }

        n
    }

    /// Bytes we own intersected with the byte range `[begin, end)`.
    pub fn count_has_bytes_in_span(&self, begin: u64, end: u64) -> u64 {
        let total = self.info.total_size();
        let begin = begin.min(total);
        let end = end.min(total);
        if begin >= end {
            return 0;
        }

        let block_size = crate::blocks::BLOCK_SIZE as u64;
        let first_block = self.info.byte_loc(begin).block;
        let final_block = self.info.byte_loc(end - 1).block;

        if first_block == final_block {
            return if self.has_block(first_block) { end - begin } else { 0 };
        }

        let mut n = 0;

        if self.has_block(first_block) {
            n += (first_block + 1) * block_size - begin;
        }

        if first_block + 1 < final_block {
            let mid = self
                .blocks
                .count(first_block as usize + 1, final_block as usize) as u64;
            n += mid * block_size;
        }

        if self.has_block(final_block) {
            n += end - final_block * block_size;
        }

        n
    }

    /// Piece-granular view of ownership, for resume files and `bitfield`
    /// messages.
    pub fn create_piece_bitfield(&self) -> Bitfield {
        let n = self.info.piece_count() as usize;
        let flags: Vec<bool> = (0..n as u32).map(|p| self.has_piece(p)).collect();
        let mut pieces = Bitfield::new(n);
        pieces.set_from_bools(&flags);
        pieces
    }

    /// The torrent calls this when file wanted-ness changes.
    pub fn invalidate_size_when_done(&self) {
        self.size_when_done.set(None);
    }

    pub fn add_block(&mut self, block: u64) {
        if self.has_block(block) {
            return;
        }
        self.blocks.set(block as usize);
        self.size_now += self.info.block_size(block) as u64;
        self.has_valid.set(None);
    }

    pub fn set_blocks(&mut self, blocks: Bitfield) {
        debug_assert_eq!(self.blocks.len(), blocks.len());
        self.blocks = blocks;
        self.size_now = self.count_has_bytes_in_blocks(BlockSpan {
            begin: 0,
            end: self.info.block_count(),
        });
        self.size_when_done.set(None);
        self.has_valid.set(None);
    }

    pub fn set_has_all(&mut self) {
        let total = self.info.total_size();
        self.blocks.set_has_all();
        self.size_now = total;
        self.size_when_done.set(Some(total));
        self.has_valid.set(Some(total));
    }

    pub fn add_piece(&mut self, piece: u32) {
        let span = self.info.block_span_for_piece(piece);
        for block in span.begin..span.end {
            self.add_block(block);
        }
    }

    pub fn remove_piece(&mut self, piece: u32) {
        let span = self.info.block_span_for_piece(piece);
        self.size_now -= self.count_has_bytes_in_blocks(span);
        self.has_valid.set(None);
        self.blocks.unset_span(span.begin as usize, span.end as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_piece_completion() -> Completion {
        // piece length == block size, so pieces and blocks coincide
        Completion::new(BlockInfo::new(4 * 16384, 16384))
    }

    #[test]
    fn test_partial_totals() {
        let mut c = four_piece_completion();
        c.add_piece(0);
        c.add_piece(2);

        assert_eq!(c.status(&AllWanted), Completeness::Leech);
        assert_eq!(c.has_total(), 32768);
        assert_eq!(c.left_until_done(&AllWanted), 32768);
        assert_eq!(c.has_valid(), 32768);
    }

    #[test]
    fn test_seed_and_partial_seed() {
        struct EvenOnly;
        impl WantedPieces for EvenOnly {
            fn piece_is_wanted(&self, piece: u32) -> bool {
                piece % 2 == 0
            }
        }

        let mut c = four_piece_completion();
        c.add_piece(0);
        c.add_piece(2);
        assert_eq!(c.status(&EvenOnly), Completeness::PartialSeed);
        assert_eq!(c.left_until_done(&EvenOnly), 0);

        c.set_has_all();
        assert_eq!(c.status(&EvenOnly), Completeness::Seed);
        assert_eq!(c.has_total(), 4 * 16384);
    }

    #[test]
    fn test_invariant_ordering() {
        let mut c = Completion::new(BlockInfo::new(100_000, 32768));
        c.add_piece(1);

        let has_total = c.has_total();
        let size_when_done = c.size_when_done(&AllWanted);
        assert!(has_total <= size_when_done);
        assert!(size_when_done <= c.info().total_size());
    }

    #[test]
    fn test_add_block_invalidates_has_valid_only() {
        let mut c = four_piece_completion();
        let done_before = c.size_when_done(&AllWanted);
        assert_eq!(c.has_valid(), 0);

        c.add_block(1);
        assert_eq!(c.has_valid(), 16384);
        assert_eq!(c.size_when_done(&AllWanted), done_before);
    }

    #[test]
    fn test_remove_piece() {
        let mut c = four_piece_completion();
        c.set_has_all();
        c.remove_piece(3);

        assert_eq!(c.has_total(), 3 * 16384);
        assert!(!c.has_piece(3));
        assert_eq!(c.has_valid(), 3 * 16384);
    }

    #[test]
    fn test_count_has_bytes_in_span_single_block() {
        let mut c = four_piece_completion();
        c.add_block(1);

        assert_eq!(c.count_has_bytes_in_span(16384 + 100, 16384 + 200), 100);
        assert_eq!(c.count_has_bytes_in_span(100, 200), 0);
    }

    #[test]
    fn test_count_has_bytes_in_span_multi_block() {
        // 5 blocks, final one short (total = 4 * 16384 + 1000)
        let mut c = Completion::new(BlockInfo::new(4 * 16384 + 1000, 16384));
        c.add_block(0);
        c.add_block(1);
        c.add_block(3);
        c.add_block(4);

        // first block partially covered, middle blocks 1 (owned) and 2
        // (missing), final block 3 fully covered
        let begin = 8192u64;
        let end = 4 * 16384;
        let expected = (16384 - 8192) + 16384 + 0 + 16384;
        assert_eq!(c.count_has_bytes_in_span(begin, end), expected);

        // span clamped to total size; tail block is short
        assert_eq!(c.count_has_bytes_in_span(4 * 16384, u64::MAX), 1000);
    }

    #[test]
    fn test_amount_done_tabs() {
        let mut c = four_piece_completion();
        c.add_piece(0);
        c.add_piece(1);

        let tabs = c.amount_done(2);
        assert_eq!(tabs, vec![1.0, 0.0]);
    }

    #[test]
    fn test_set_blocks_recomputes_size() {
        let mut c = Completion::new(BlockInfo::new(4 * 16384 + 1000, 16384));
        let mut blocks = Bitfield::new(5);
        blocks.set(0);
        blocks.set(4);
        c.set_blocks(blocks);

        assert_eq!(c.has_total(), 16384 + 1000);
    }

    #[test]
    fn test_piece_bitfield() {
        let mut c = four_piece_completion();
        c.add_piece(0);
        c.add_piece(3);

        let pieces = c.create_piece_bitfield();
        assert!(pieces.has(0));
        assert!(!pieces.has(1));
        assert!(pieces.has(3));
    }
}
