use rand::seq::SliceRandom;
use crate::pieceset::PieceSet;

/*
Pieces are picked in rarest-first order using the availability counts
accumulated from every bitfield and have message we see. Picking strictly
by count would stampede the swarm onto one piece, so ties between equally
rare candidates are broken at random.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PieceState {

    NotFetched,

    // Chunk set populated, download in progress.
    Chunked,

    // Verified and on disk.
    Fetched,

}

#[derive(Debug)]
pub(super) struct PieceTable {

    states: Vec<PieceState>,

    // Number of peers observed holding each piece.
    frequency: Vec<usize>,

    // The pieces we have, mutated only via commit().
    have: PieceSet,

}

impl PieceTable {

    pub fn new(num_pieces: usize) -> Self {
        Self {
            states: vec![PieceState::NotFetched; num_pieces],
            frequency: vec![0; num_pieces],
            have: PieceSet::empty(num_pieces),
        }
    }

    pub fn have(&self) -> &PieceSet {
        &self.have
    }

    pub fn is_seeding(&self) -> bool {
        self.have.is_full()
    }

    // True if the peer holds at least one piece we lack.
    pub fn check_interest(&self, peer: &PieceSet) -> bool {
        peer.iter().any(|idx| !self.have.contains(idx))
    }

    // Folds a full bitfield into the availability counts; returns interest.
    pub fn observe_bitfield(&mut self, peer: &PieceSet) -> bool {
        let mut interested = false;
        for idx in peer.iter() {
            self.frequency[idx] += 1;
            if !self.have.contains(idx) {
                interested = true;
            }
        }
        interested
    }

    // Counts a have message; returns whether we lack the piece.
    pub fn observe_have(&mut self, idx: usize) -> bool {
        assert!(idx < self.frequency.len());
        self.frequency[idx] += 1;
        !self.have.contains(idx)
    }

    /// Picks the rarest not-yet-started piece the peer can serve and
    /// transitions it to Chunked.
    pub fn pick_rarest(&mut self, peer: &PieceSet) -> Option<usize> {

        let mut rarest = usize::MAX;
        let mut candidates = Vec::new();
        for idx in peer.iter() {
            if self.states[idx] != PieceState::NotFetched || self.have.contains(idx) {
                continue;
            }
            let freq = self.frequency[idx];
            if freq < rarest {
                rarest = freq;
                candidates.clear();
            }
            if freq == rarest {
                candidates.push(idx);
            }
        }

        let idx = *candidates.choose(&mut rand::thread_rng())?;
        self.states[idx] = PieceState::Chunked;
        Some(idx)
    }

    pub fn commit(&mut self, idx: usize) {
        self.states[idx] = PieceState::Fetched;
        self.have.insert(idx);
    }

    pub fn invalidate(&mut self, idx: usize) {
        self.states[idx] = PieceState::NotFetched;
    }

    #[cfg(test)]
    pub fn state(&self, idx: usize) -> PieceState {
        self.states[idx]
    }
}
