//! Most-recently-used ranking of bonded peers.
//!
//! [`DeviceOrder`] holds up to [`ORDER_CAPACITY`] peer ids, front = most
//! recently used. Entries are always compacted: occupied slots first,
//! then [`ORDER_FREE`] sentinels. The order persists as a single record:
//!
//! ```text
//! [0..5]  order entries, one byte each (0xFF = free)
//! [5..9]  magic validator 0xAABBCCDD, little-endian
//! ```
//!
//! A record without the validator (never written, erased, corrupted) is
//! treated as absent. Orders are drawn from the fixed [`OrderPool`].

use crate::ble::PeerId;
use crate::config::{ORDER_CAPACITY, ORDER_FREE, ORDER_MAGIC, ORDER_POOL_SIZE, RECORD_KEY_ORDER};
use crate::storage::{RecordStore, StorageError};

/// Size of the persisted order record.
pub const ORDER_RECORD_LEN: usize = ORDER_CAPACITY + 4;

/// Effect of [`DeviceOrder::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Insert {
    /// The peer already was the most recently used one.
    Unchanged,
    /// The peer moved or was added to the front.
    Promoted,
    /// As `Promoted`, and the order was full: the least recently used peer fell off.
    Evicted(PeerId),
}

impl Insert {
    /// Whether the order differs from before the insert.
    pub fn changed(self) -> bool {
        self != Insert::Unchanged
    }
}

/// Fixed-capacity MRU list of peer ids.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceOrder {
    slots: [u8; ORDER_CAPACITY],
}

impl Default for DeviceOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceOrder {
    /// Create an empty order.
    pub const fn new() -> Self {
        Self {
            slots: [ORDER_FREE; ORDER_CAPACITY],
        }
    }

    /// Move `peer` to the front.
    ///
    /// If `peer` was absent and the order was full, the least recently
    /// used entry falls off the end.
    pub fn insert(&mut self, peer: PeerId) -> Insert {
        let pos = self.rank_of(peer).unwrap_or(ORDER_CAPACITY - 1);
        if pos == 0 && self.slots[0] == peer.raw() {
            return Insert::Unchanged;
        }

        let evicted = PeerId::new(self.slots[pos]).filter(|&p| p != peer);
        self.slots.copy_within(0..pos, 1);
        self.slots[0] = peer.raw();

        match evicted {
            Some(old) => {
                debug!("Order full, evicted peer {}", old);
                Insert::Evicted(old)
            }
            None => Insert::Promoted,
        }
    }

    /// Drop every peer for which `keep` returns `false`, preserving the
    /// rank order of the rest. Returns the number of peers dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(PeerId) -> bool) -> usize {
        let mut kept = [ORDER_FREE; ORDER_CAPACITY];
        let mut len = 0;
        for peer in self.iter().filter(|&p| keep(p)) {
            kept[len] = peer.raw();
            len += 1;
        }
        let dropped = self.count() - len;
        self.slots = kept;
        dropped
    }

    /// Position of `peer`, 0 = most recently used.
    pub fn rank_of(&self, peer: PeerId) -> Option<usize> {
        self.slots.iter().position(|&raw| raw == peer.raw())
    }

    /// Peer at `rank`, if that slot is occupied.
    pub fn item_at(&self, rank: usize) -> Option<PeerId> {
        self.slots.get(rank).copied().and_then(PeerId::new)
    }

    /// Number of occupied slots, counted from the front up to the first free one.
    pub fn count(&self) -> usize {
        self.slots
            .iter()
            .position(|&raw| raw == ORDER_FREE)
            .unwrap_or(ORDER_CAPACITY)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Forget every peer.
    pub fn clear(&mut self) {
        self.slots = [ORDER_FREE; ORDER_CAPACITY];
    }

    /// Peers from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.slots.iter().map_while(|&raw| PeerId::new(raw))
    }

    /// Serialize into the persisted record layout.
    pub fn encode(&self) -> [u8; ORDER_RECORD_LEN] {
        let mut record = [0u8; ORDER_RECORD_LEN];
        record[..ORDER_CAPACITY].copy_from_slice(&self.slots);
        record[ORDER_CAPACITY..].copy_from_slice(&ORDER_MAGIC.to_le_bytes());
        record
    }

    /// Parse a persisted record.
    ///
    /// Rejects records with a wrong length or validator, and records whose
    /// entries are not compacted or contain duplicates.
    pub fn decode(record: &[u8]) -> Option<Self> {
        if record.len() != ORDER_RECORD_LEN {
            return None;
        }
        let (entries, magic) = record.split_at(ORDER_CAPACITY);
        if magic != ORDER_MAGIC.to_le_bytes() {
            return None;
        }

        let mut slots = [ORDER_FREE; ORDER_CAPACITY];
        slots.copy_from_slice(entries);

        let used = slots
            .iter()
            .position(|&raw| raw == ORDER_FREE)
            .unwrap_or(ORDER_CAPACITY);
        if slots[used..].iter().any(|&raw| raw != ORDER_FREE) {
            return None;
        }
        for i in 0..used {
            if slots[i + 1..used].contains(&slots[i]) {
                return None;
            }
        }
        Some(Self { slots })
    }

    /// Write the order record to `store`.
    pub fn persist<S: RecordStore>(&self, store: &mut S) -> Result<(), StorageError> {
        store.write(RECORD_KEY_ORDER, &self.encode())
    }

    /// Replace the order with the record held by `store`.
    ///
    /// Returns `Ok(false)` and leaves the order untouched when the record
    /// is missing or invalid.
    pub fn restore<S: RecordStore>(&mut self, store: &mut S) -> Result<bool, StorageError> {
        let mut buf = [0u8; ORDER_RECORD_LEN + 1];
        let Some(len) = store.read(RECORD_KEY_ORDER, &mut buf)? else {
            return Ok(false);
        };
        match buf.get(..len).and_then(Self::decode) {
            Some(order) => {
                *self = order;
                Ok(true)
            }
            None => {
                warn!("Order record invalid ({} bytes), ignored", len);
                Ok(false)
            }
        }
    }
}

/// Stable handle to an allocated [`OrderPool`] slot.
///
/// Deliberately not `Copy`: freeing consumes the handle.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OrderSlot(usize);

/// Fixed arena of device orders.
pub struct OrderPool {
    orders: [DeviceOrder; ORDER_POOL_SIZE],
    used: [bool; ORDER_POOL_SIZE],
}

impl Default for OrderPool {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderPool {
    pub const fn new() -> Self {
        Self {
            orders: [const { DeviceOrder::new() }; ORDER_POOL_SIZE],
            used: [false; ORDER_POOL_SIZE],
        }
    }

    /// Take a free order, cleared. `None` when the pool is exhausted.
    pub fn alloc(&mut self) -> Option<OrderSlot> {
        let idx = self.used.iter().position(|used| !used)?;
        self.used[idx] = true;
        self.orders[idx].clear();
        Some(OrderSlot(idx))
    }

    /// Return a slot to the pool.
    pub fn free(&mut self, slot: OrderSlot) -> bool {
        match self.used.get_mut(slot.0) {
            Some(used) if *used => {
                *used = false;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, slot: &OrderSlot) -> &DeviceOrder {
        &self.orders[slot.0]
    }

    pub fn get_mut(&mut self, slot: &OrderSlot) -> &mut DeviceOrder {
        &mut self.orders[slot.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn peer(raw: u8) -> PeerId {
        PeerId::new(raw).unwrap()
    }

    fn peers(order: &DeviceOrder) -> Vec<u8> {
        order.iter().map(PeerId::raw).collect()
    }

    #[derive(Default)]
    struct MemStore {
        records: HashMap<u16, Vec<u8>>,
    }

    impl RecordStore for MemStore {
        fn read(&mut self, key: u16, buf: &mut [u8]) -> Result<Option<usize>, StorageError> {
            Ok(self.records.get(&key).map(|data| {
                buf[..data.len()].copy_from_slice(data);
                data.len()
            }))
        }

        fn write(&mut self, key: u16, data: &[u8]) -> Result<(), StorageError> {
            self.records.insert(key, data.to_vec());
            Ok(())
        }

        fn collect_garbage(&mut self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn inserting_front_is_noop() {
        let mut order = DeviceOrder::new();
        order.insert(peer(1));
        order.insert(peer(2));
        let before = order.clone();

        assert_eq!(order.insert(peer(2)), Insert::Unchanged);
        assert!(!Insert::Unchanged.changed());
        assert_eq!(order, before);
    }

    #[test]
    fn insert_yields_reverse_insertion_order() {
        let mut order = DeviceOrder::new();
        for k in 0..ORDER_CAPACITY as u8 {
            order.insert(peer(10 + k));
            assert_eq!(order.count(), k as usize + 1);
        }
        assert_eq!(peers(&order), vec![14, 13, 12, 11, 10]);
        assert_eq!(order.item_at(0), Some(peer(14)));
        assert_eq!(order.item_at(4), Some(peer(10)));
    }

    #[test]
    fn reinsert_moves_to_front() {
        let mut order = DeviceOrder::new();
        for raw in [1, 2, 3, 4] {
            order.insert(peer(raw));
        }
        assert_eq!(order.insert(peer(2)), Insert::Promoted);
        assert_eq!(peers(&order), vec![2, 4, 3, 1]);
        assert_eq!(order.count(), 4);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let mut order = DeviceOrder::new();
        for raw in 0..ORDER_CAPACITY as u8 {
            assert_eq!(order.insert(peer(raw)), Insert::Promoted);
        }
        assert_eq!(order.insert(peer(42)), Insert::Evicted(peer(0)));
        assert_eq!(order.rank_of(peer(0)), None);
        assert_eq!(order.count(), ORDER_CAPACITY);
        assert_eq!(peers(&order), vec![42, 4, 3, 2, 1]);
    }

    #[test]
    fn moving_last_entry_of_full_order_evicts_nothing() {
        let mut order = DeviceOrder::new();
        for raw in 0..ORDER_CAPACITY as u8 {
            order.insert(peer(raw));
        }
        assert_eq!(order.insert(peer(0)), Insert::Promoted);
        assert_eq!(peers(&order), vec![0, 4, 3, 2, 1]);
    }

    #[test]
    fn retain_compacts_in_rank_order() {
        let mut order = DeviceOrder::new();
        for raw in [1, 2, 3, 4] {
            order.insert(peer(raw));
        }
        assert_eq!(order.retain(|p| p.raw() % 2 == 1), 2);
        assert_eq!(peers(&order), vec![3, 1]);
        assert_eq!(order.count(), 2);
        assert_eq!(order.item_at(2), None);

        assert_eq!(order.retain(|_| true), 0);
        assert_eq!(peers(&order), vec![3, 1]);
    }

    #[test]
    fn item_at_and_rank_of_on_free_slots() {
        let mut order = DeviceOrder::new();
        order.insert(peer(7));
        assert_eq!(order.rank_of(peer(7)), Some(0));
        assert_eq!(order.rank_of(peer(8)), None);
        assert_eq!(order.item_at(1), None);
        assert_eq!(order.item_at(ORDER_CAPACITY), None);
    }

    #[test]
    fn clear_empties_the_order() {
        let mut order = DeviceOrder::new();
        order.insert(peer(1));
        order.insert(peer(2));
        order.clear();
        assert!(order.is_empty());
        assert_eq!(order.iter().count(), 0);
    }

    #[test]
    fn record_layout() {
        let mut order = DeviceOrder::new();
        order.insert(peer(3));
        order.insert(peer(9));
        assert_eq!(
            order.encode(),
            [9, 3, 0xFF, 0xFF, 0xFF, 0xDD, 0xCC, 0xBB, 0xAA]
        );
    }

    #[test]
    fn persist_restore_round_trip() {
        let mut store = MemStore::default();
        let mut order = DeviceOrder::new();
        for raw in [5, 6, 7] {
            order.insert(peer(raw));
        }
        order.persist(&mut store).unwrap();

        let mut restored = DeviceOrder::new();
        assert_eq!(restored.restore(&mut store), Ok(true));
        assert_eq!(restored, order);
    }

    #[test]
    fn restore_from_missing_record_leaves_order_unchanged() {
        let mut store = MemStore::default();
        let mut order = DeviceOrder::new();
        order.insert(peer(1));
        let before = order.clone();

        assert_eq!(order.restore(&mut store), Ok(false));
        assert_eq!(order, before);
    }

    #[test]
    fn restore_from_erased_storage_fails() {
        for fill in [0x00, 0xFF] {
            let mut store = MemStore::default();
            store.records.insert(RECORD_KEY_ORDER, vec![fill; ORDER_RECORD_LEN]);

            let mut order = DeviceOrder::new();
            order.insert(peer(4));
            let before = order.clone();

            assert_eq!(order.restore(&mut store), Ok(false));
            assert_eq!(order, before);
        }
    }

    #[test]
    fn decode_rejects_broken_invariants() {
        let magic = ORDER_MAGIC.to_le_bytes();
        let with_entries = |entries: [u8; ORDER_CAPACITY]| {
            let mut record = entries.to_vec();
            record.extend_from_slice(&magic);
            record
        };

        assert!(DeviceOrder::decode(&with_entries([1, 2, 0xFF, 0xFF, 0xFF])).is_some());
        // Gap before an occupied slot.
        assert!(DeviceOrder::decode(&with_entries([1, 0xFF, 2, 0xFF, 0xFF])).is_none());
        // Duplicate peer.
        assert!(DeviceOrder::decode(&with_entries([1, 2, 1, 0xFF, 0xFF])).is_none());
        // Truncated.
        assert!(DeviceOrder::decode(&with_entries([1, 2, 3, 4, 5])[..8]).is_none());
    }

    #[test]
    fn pool_hands_out_two_orders() {
        let mut pool = OrderPool::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());

        pool.get_mut(&a).insert(peer(1));
        assert_eq!(pool.get(&a).count(), 1);
        assert_eq!(pool.get(&b).count(), 0);

        assert!(pool.free(a));
        let c = pool.alloc().unwrap();
        assert!(pool.get(&c).is_empty());
    }
}
