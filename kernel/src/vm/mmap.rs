//! Per-process bookkeeping of memory-mapped files.

use super::Page;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub u32);

#[derive(Default)]
pub struct MappingTable {
    next_id: u32,
    mappings: BTreeMap<MapId, Vec<Arc<Page>>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids are never reused within a process.
    pub fn allocate_id(&mut self) -> MapId {
        let id = MapId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn register_mapping(&mut self, id: MapId, page: Arc<Page>) {
        self.mappings.entry(id).or_default().push(page);
    }

    /// Removes the mapping, returning its pages in address order.
    pub fn unregister_mapping(&mut self, id: MapId) -> Option<Vec<Arc<Page>>> {
        self.mappings.remove(&id)
    }

    pub fn ids(&self) -> Vec<MapId> {
        self.mappings.keys().copied().collect()
    }

    pub fn pages(&self, id: MapId) -> Option<&[Arc<Page>]> {
        self.mappings.get(&id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Backing;

    #[test]
    fn ids_are_unique() {
        let mut table = MappingTable::new();
        let a = table.allocate_id();
        let b = table.allocate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn register_and_unregister() {
        let mut table = MappingTable::new();
        let id = table.allocate_id();
        for i in 0..3 {
            table.register_mapping(id, Page::new(0x1000 * (i + 1), true, Backing::Swap { slot: None }));
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.pages(id).map(<[_]>::len), Some(3));

        let pages = table.unregister_mapping(id).unwrap();
        assert_eq!(pages[0].address(), 0x1000);
        assert!(table.is_empty());
        assert!(table.unregister_mapping(id).is_none());
    }
}
