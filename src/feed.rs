//! The public dream pool
//!
//! Append-only list of short posts. Fishing draws uniformly from the most
//! recent `window` dreams (excluding the fisher's own) and bumps the
//! caught dream's counter. Old dreams sink: they stay stored but fall out
//! of the sampling window, which keeps the draw cost bounded.

use std::sync::RwLock;

use rand::Rng;

use crate::types::Dream;

/// Maximum dream content length, characters
pub const MAX_DREAM_LEN: usize = 280;

pub struct DreamPool {
    dreams: RwLock<Vec<Dream>>,
    window: usize,
}

impl DreamPool {
    pub fn new(window: usize) -> Self {
        Self {
            dreams: RwLock::new(Vec::new()),
            window,
        }
    }

    /// Append a dream to the pool
    pub fn plant(&self, dream: Dream) {
        self.dreams.write().unwrap().push(dream);
    }

    /// Draw one dream at random from the recent window, skipping the
    /// excluded author's own posts. Bumps the fish counter of the catch.
    /// Returns `None` when no eligible dream exists; an empty pool is not
    /// an error.
    pub fn fish(&self, excluding_author: Option<&str>) -> Option<Dream> {
        let mut dreams = self.dreams.write().unwrap();

        let start = dreams.len().saturating_sub(self.window);
        let eligible: Vec<usize> = (start..dreams.len())
            .filter(|&i| {
                excluding_author
                    .map(|author| dreams[i].author_public_key != author)
                    .unwrap_or(true)
            })
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let pick = eligible[rand::thread_rng().gen_range(0..eligible.len())];
        dreams[pick].fish_count += 1;
        Some(dreams[pick].clone())
    }

    pub fn len(&self) -> usize {
        self.dreams.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dreams.read().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Dream> {
        self.dreams.read().unwrap().clone()
    }

    pub fn restore(&self, dreams: Vec<Dream>) {
        *self.dreams.write().unwrap() = dreams;
    }
}
