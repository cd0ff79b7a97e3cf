//! Blank node id minting
//!
//! Concurrent clones may insert anonymous subjects simultaneously; labels
//! are minted from a random stable base per clone so they never collide
//! across the domain.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::term::Term;

/// Mints blank node labels unique across clones
#[derive(Debug)]
pub struct BlankIdSource {
    base: String,
    counter: AtomicU64,
}

impl BlankIdSource {
    /// Create a source with a fresh random base
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let base: String = (0..8)
            .map(|_| {
                let n: u8 = rng.gen_range(0..16);
                char::from_digit(n as u32, 16).unwrap_or('0')
            })
            .collect();
        Self {
            base,
            counter: AtomicU64::new(0),
        }
    }

    /// Create a source with a fixed base (tests)
    pub fn with_base(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Mint the next blank node label
    pub fn mint_label(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("q{}n{}", self.base, n)
    }

    /// Mint the next blank node term
    pub fn mint(&self) -> Term {
        Term::blank(self.mint_label())
    }
}

impl Default for BlankIdSource {
    fn default() -> Self {
        Self::new()
    }
}
