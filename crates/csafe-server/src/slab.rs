//! Pollable storage addressed by generation-checked `Token`s.
//!
//! Slot indices are recycled through a free list. Each reuse bumps the
//! slot's generation, so a token held by a finished block client never
//! reaches the slot's next occupant.

use csafe_core::pollable::Token;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Slab<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in (0..capacity).rev() {
            free.push(i);
        }
        for _ in 0..capacity {
            slots.push(Slot { generation: 0, value: None });
        }
        Self { slots, free, len: 0 }
    }

    pub fn insert(&mut self, value: T) -> Token {
        let slot = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot { generation: 0, value: None });
                self.slots.len() - 1
            }
        };
        let entry = &mut self.slots[slot];
        entry.generation = entry.generation.wrapping_add(1);
        entry.value = Some(value);
        self.len += 1;
        Token {
            slot: slot as u32,
            generation: entry.generation,
        }
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        let entry = self.slots.get_mut(token.slot as usize)?;
        if entry.generation != token.generation {
            return None;
        }
        entry.value.as_mut()
    }

    pub fn get(&self, token: Token) -> Option<&T> {
        let entry = self.slots.get(token.slot as usize)?;
        if entry.generation != token.generation {
            return None;
        }
        entry.value.as_ref()
    }

    pub fn remove(&mut self, token: Token) -> Option<T> {
        let entry = self.slots.get_mut(token.slot as usize)?;
        if entry.generation != token.generation {
            return None;
        }
        let value = entry.value.take()?;
        self.free.push(token.slot as usize);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tokens of all occupied slots.
    pub fn tokens(&self) -> Vec<Token> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, s)| Token {
                slot: i as u32,
                generation: s.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_token_misses_reused_slot() {
        let mut slab = Slab::with_capacity(1);
        let a = slab.insert("a");
        assert_eq!(slab.remove(a), Some("a"));
        let b = slab.insert("b");
        assert_eq!(a.slot, b.slot);
        assert_ne!(a.generation, b.generation);
        assert!(slab.get_mut(a).is_none());
        assert_eq!(slab.get(b), Some(&"b"));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn grows_past_capacity() {
        let mut slab = Slab::with_capacity(2);
        let tokens: Vec<_> = (0..5).map(|i| slab.insert(i)).collect();
        assert_eq!(slab.len(), 5);
        assert_eq!(slab.tokens(), tokens);
        assert_eq!(tokens[0].slot, 0);
    }
}
