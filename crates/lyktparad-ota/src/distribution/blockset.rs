// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Lyktparad.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

/// Fixed-size bitset of block indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSet {
    words: Vec<u64>,
    len: u16,
    count: u16,
}

impl BlockSet {
    pub fn new(len: u16) -> Self {
        Self {
            words: vec![0; usize::from(len).div_ceil(64)],
            len,
            count: 0,
        }
    }

    fn position(index: u16) -> (usize, u64) {
        (usize::from(index >> 6), 1u64 << (index & 63))
    }

    /// Returns true if `index` was not in the set before.
    pub fn insert(&mut self, index: u16) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, mask) = Self::position(index);
        match self.words.get_mut(word) {
            Some(bits) if *bits & mask == 0 => {
                *bits |= mask;
                self.count += 1;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, index: u16) -> bool {
        let (word, mask) = Self::position(index);
        index < self.len && self.words.get(word).is_some_and(|bits| bits & mask != 0)
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.len
    }

    pub fn first_missing(&self) -> Option<u16> {
        (0..self.len).find(|&index| !self.contains(index))
    }
}
