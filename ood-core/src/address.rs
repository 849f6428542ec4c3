//! Resolved addresses: generation-numbered snapshots, and the owned lists handed to callers.

use std::sync::Arc;

use parking_lot::RwLock;

/// An owned, immutable list of resolved addresses (`ip:port`), in discovery order.
///
/// Move-only: the caller owns it until it is released or dropped. Every list is a
/// fresh copy taken from one snapshot, so it never shares storage with the stack
/// and never mixes entries from two generations.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressList {
    generation: u64,
    addresses: Vec<String>,
}

impl AddressList {
    /// Snapshot generation this list was copied from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.addresses
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.addresses.iter()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.addresses
    }

    /// Explicit release. Equivalent to dropping the list.
    pub fn release(self) {}
}

impl IntoIterator for AddressList {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.addresses.into_iter()
    }
}

impl<'a> IntoIterator for &'a AddressList {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.addresses.iter()
    }
}

struct Snapshot {
    generation: u64,
    addresses: Vec<String>,
}

/// Current address set. Publishing swaps in a whole new snapshot; readers copy
/// from whichever snapshot was current when they looked.
pub(crate) struct AddressBook {
    current: RwLock<Arc<Snapshot>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot {
                generation: 0,
                addresses: Vec::new(),
            })),
        }
    }

    /// Replace the address set. Duplicates are dropped, first occurrence wins.
    /// Returns the new generation.
    pub fn publish(&self, addresses: Vec<String>) -> u64 {
        let mut unique: Vec<String> = Vec::with_capacity(addresses.len());
        for addr in addresses {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        let mut current = self.current.write();
        let generation = current.generation + 1;
        *current = Arc::new(Snapshot {
            generation,
            addresses: unique,
        });
        generation
    }

    /// Publish an empty set (stack stopped).
    pub fn clear(&self) -> u64 {
        self.publish(Vec::new())
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Copy out the current snapshot.
    pub fn list(&self) -> AddressList {
        let snapshot = Arc::clone(&self.current.read());
        AddressList {
            generation: snapshot.generation,
            addresses: snapshot.addresses.clone(),
        }
    }
}
