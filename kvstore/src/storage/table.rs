use std::{collections::HashMap, sync::Arc};

use comms::Key;
use parking_lot::RwLock;

use super::ParameterSlot;
use crate::{KvErr, Result};

/// The slots of every initialized key.
#[derive(Debug)]
pub struct SlotTable {
    num_workers: usize,
    slots: RwLock<HashMap<Key, Arc<ParameterSlot>>>,
}

impl SlotTable {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the slot of `key`.
    ///
    /// # Returns
    /// `DuplicateKey` if `key` already has a slot.
    pub fn init(&self, key: Key, value: Vec<f32>) -> Result<()> {
        let index = usize::try_from(key)
            .map_err(|_| KvErr::InvalidConfiguration(format!("key {key} overflows an index")))?;

        let mut slots = self.slots.write();
        if slots.contains_key(&key) {
            return Err(KvErr::DuplicateKey(key));
        }

        let slot = ParameterSlot::new(index, value, self.num_workers);
        slots.insert(key, Arc::new(slot));
        Ok(())
    }

    /// Returns the slot of `key`.
    ///
    /// # Returns
    /// `UninitializedKey` if `key` has no slot.
    pub fn get(&self, key: Key) -> Result<Arc<ParameterSlot>> {
        self.slots
            .read()
            .get(&key)
            .cloned()
            .ok_or(KvErr::UninitializedKey(key))
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the optimizer state of every slot.
    pub fn reset_states(&self) {
        self.slots.read().values().for_each(|slot| slot.reset_state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_once() {
        let table = SlotTable::new(1);
        table.init(3, vec![1.]).unwrap();

        assert!(matches!(table.init(3, vec![2.]), Err(KvErr::DuplicateKey(3))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_key() {
        let table = SlotTable::new(1);
        assert!(matches!(table.get(9), Err(KvErr::UninitializedKey(9))));
    }
}
