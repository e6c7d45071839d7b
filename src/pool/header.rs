//! free chunk headers
//!
//! a collector keeps `{size, next}` in the first bytes of every free chunk.
//! here the headers live in a table keyed by chunk address instead, so the
//! pool can track ranges it never dereferences

use super::Address;
use crate::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeHeader {
    pub(crate) size: usize,
    pub(crate) next: Option<Address>,
}

#[derive(Debug, Default)]
pub(crate) struct FreeHeaderTable {
    headers: FxHashMap<Address, FreeHeader>,
}

impl FreeHeaderTable {
    pub(crate) fn get(&self, entry: Address) -> FreeHeader {
        match self.headers.get(&entry) {
            Some(header) => *header,
            None => panic!("{entry} is not the start of a free entry"),
        }
    }

    fn get_mut(&mut self, entry: Address) -> &mut FreeHeader {
        match self.headers.get_mut(&entry) {
            Some(header) => header,
            None => panic!("{entry} is not the start of a free entry"),
        }
    }

    pub(crate) fn size(&self, entry: Address) -> usize {
        self.get(entry).size
    }

    pub(crate) fn next(&self, entry: Address) -> Option<Address> {
        self.get(entry).next
    }

    pub(crate) fn after_end(&self, entry: Address) -> Address {
        entry + self.get(entry).size
    }

    pub(crate) fn set_next(&mut self, entry: Address, next: Option<Address>) {
        self.get_mut(entry).next = next;
    }

    pub(crate) fn expand(&mut self, entry: Address, bytes: usize) {
        self.get_mut(entry).size += bytes;
    }

    pub(crate) fn insert(&mut self, entry: Address, size: usize, next: Option<Address>) {
        debug_assert!(next.is_none_or(|next| entry + size <= next));
        self.headers.insert(entry, FreeHeader { size, next });
    }

    pub(crate) fn remove(&mut self, entry: Address) -> Option<FreeHeader> {
        self.headers.remove(&entry)
    }

    pub(crate) fn contains(&self, entry: Address) -> bool {
        self.headers.contains_key(&entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.headers.len()
    }

    pub(crate) fn clear(&mut self) {
        self.headers.clear();
    }
}
