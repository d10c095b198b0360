//! Chooses which blocks to request from a peer.
//!
//! Candidate pieces are ranked high-priority first, then nearly-complete
//! first, with a random tiebreak so peers don't converge on the same
//! pieces. Blocks inside a piece go out in ascending order so data lands
//! contiguously. Only endgame mode may hand out a block that is already
//! requested from another peer.

use rand::Rng as _;

use crate::blocks::BlockSpan;
use crate::torrent::Priority;

/// The per-peer view the chooser works from.
pub trait PeerInfo {
    fn piece_count(&self) -> u32;

    fn priority(&self, piece: u32) -> Priority;

    fn block_span(&self, piece: u32) -> BlockSpan;

    fn missing_block_count(&self, piece: u32) -> u64;

    /// The peer has this piece and we want it.
    fn client_can_request_piece(&self, piece: u32) -> bool;

    /// We haven't already asked anyone for this block.
    fn client_can_request_block(&self, block: u64) -> bool;

    /// How many peers we've asked for this block.
    fn count_active_requests(&self, block: u64) -> usize;

    fn is_endgame(&self) -> bool;
}

struct Candidate {
    piece: u32,
    priority: Priority,
    missing: u64,
    salt: u32,
}

impl Candidate {
    // high priority first, nearly-done first, then random
    fn sort_key(&self) -> (std::cmp::Reverse<i8>, u64, u32) {
        (std::cmp::Reverse(self.priority.score()), self.missing, self.salt)
    }
}

/// Returns at most `n_wanted` blocks' worth of spans to request from this
/// peer, fewest spans possible.
pub fn next_spans(peer: &dyn PeerInfo, n_wanted: u64) -> Vec<BlockSpan> {
    if n_wanted == 0 {
        return Vec::new();
    }

    let mut rng = rand::rng();
    let mut candidates: Vec<Candidate> = (0..peer.piece_count())
        .filter(|&piece| peer.client_can_request_piece(piece))
        .map(|piece| Candidate {
            piece,
            priority: peer.priority(piece),
            missing: peer.missing_block_count(piece),
            salt: rng.random(),
        })
        .collect();
    candidates.sort_by_key(Candidate::sort_key);

    let is_endgame = peer.is_endgame();
    let mut spans: Vec<BlockSpan> = Vec::new();
    let mut n_queued = 0u64;

    for candidate in &candidates {
        let span = peer.block_span(candidate.piece);
        for block in span.begin..span.end {
            if !peer.client_can_request_block(block) {
                continue;
            }
            if !is_endgame && peer.count_active_requests(block) > 0 {
                continue;
            }

            let coalesces = spans.last().is_some_and(|tail| tail.end == block);
            if coalesces {
                let tail = spans.len() - 1;
                spans[tail].end += 1;
            } else {
                spans.push(BlockSpan {
                    begin: block,
                    end: block + 1,
                });
            }

            n_queued += 1;
            if n_queued >= n_wanted {
                return spans;
            }
        }
    }

    spans
}
