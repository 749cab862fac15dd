use gpu_page_meta::{
    DmaAddress, OwnershipTag, PageMetadataStore, PhysicalAddress, StoreError,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn pa(pfn: u64) -> PhysicalAddress {
    PhysicalAddress::from_pfn(pfn)
}

#[test]
fn insert_lookup_remove() {
    let store = PageMetadataStore::with_capacity(4);
    let h = store
        .insert(pa(10), DmaAddress::new(0xA000), 0, 3)
        .unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(store.lookup(pa(10)), Some(h));
    let rec = store.record(h).unwrap();
    assert_eq!(rec.phys, pa(10));
    assert_eq!(rec.dma, DmaAddress::new(0xA000));
    assert_eq!(rec.status.group_id(), 3);
    assert_eq!(rec.status.tag(), OwnershipTag::AllocateInProgress);

    let removed = store.remove(h).unwrap();
    assert_eq!(removed.phys, pa(10));
    assert!(store.is_empty());
    assert_eq!(store.lookup(pa(10)), None);
    assert_eq!(store.record(h).map(|r| r.phys), None);
    assert_eq!(store.remove(h).unwrap_err(), StoreError::InvalidHandle);
}

#[test]
fn duplicate_and_exhaustion_are_reported() {
    let store = PageMetadataStore::with_capacity(1);
    store.insert(pa(1), DmaAddress::new(0), 0, 0).unwrap();
    assert_eq!(
        store.insert(pa(1), DmaAddress::new(0), 0, 0).unwrap_err(),
        StoreError::AlreadyTracked(pa(1))
    );
    assert_eq!(
        store.insert(pa(2), DmaAddress::new(0), 0, 0).unwrap_err(),
        StoreError::Exhausted
    );
}

#[test]
fn slots_are_recycled() {
    let store = PageMetadataStore::with_capacity(1);
    let a = store.insert(pa(1), DmaAddress::new(0), 0, 0).unwrap();
    store.remove(a).unwrap();
    let b = store.insert(pa(2), DmaAddress::new(0), 0, 0).unwrap();
    assert_eq!(a.index(), b.index());
    assert_eq!(store.lookup(pa(2)), Some(b));
}

#[test]
fn stale_handle_does_not_reach_the_next_occupant() {
    let store = PageMetadataStore::with_capacity(1);
    let stale = store.insert(pa(1), DmaAddress::new(0), 0, 0).unwrap();
    store.remove(stale).unwrap();
    let fresh = store.insert(pa(2), DmaAddress::new(0), 0, 0).unwrap();

    assert_eq!(stale.index(), fresh.index());
    assert_ne!(stale, fresh);
    assert!(store.record(stale).is_none());
    assert_eq!(store.tag(stale), None);
    assert_eq!(
        store.set_tag(stale, OwnershipTag::Pooled).unwrap_err(),
        StoreError::InvalidHandle
    );
    assert_eq!(store.remove(stale).unwrap_err(), StoreError::InvalidHandle);

    assert_eq!(store.tag(fresh), Some(OwnershipTag::AllocateInProgress));
    assert_eq!(store.record(fresh).map(|r| r.phys), Some(pa(2)));
}

#[test]
fn retag_leaves_not_movable_pages_alone() {
    let store = PageMetadataStore::with_capacity(2);
    let movable = store.insert(pa(1), DmaAddress::new(0), 0, 0).unwrap();
    let pinned = store.insert(pa(2), DmaAddress::new(0), 0, 0).unwrap();
    store.set_tag(pinned, OwnershipTag::NotMovable).unwrap();

    let prev = store.retag(movable, OwnershipTag::Pooled).unwrap();
    assert_eq!(prev, OwnershipTag::AllocateInProgress);
    assert_eq!(store.tag(movable), Some(OwnershipTag::Pooled));

    let prev = store.retag(pinned, OwnershipTag::Pooled).unwrap();
    assert_eq!(prev, OwnershipTag::NotMovable);
    assert_eq!(store.tag(pinned), Some(OwnershipTag::NotMovable));
}

#[test]
fn deferred_flag_reports_previous_value() {
    let store = PageMetadataStore::with_capacity(1);
    let h = store.insert(pa(1), DmaAddress::new(0), 0, 0).unwrap();
    assert!(!store.set_deferred(h, true).unwrap());
    assert!(store.is_deferred(h));
    assert!(store.set_deferred(h, false).unwrap());
    assert!(!store.is_deferred(h));
}

#[test]
fn concurrent_insert_remove_keeps_index_consistent() {
    let threads = 4;
    let per_thread = 500u64;
    let store = Arc::new(PageMetadataStore::with_capacity(64));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads as u64)
        .map(|t| {
            let store = Arc::clone(&store);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..per_thread {
                    let phys = pa(t * 1_000_000 + i);
                    let h = store.insert(phys, DmaAddress::new(0), 0, 0).unwrap();
                    store.set_tag(h, OwnershipTag::Pooled).unwrap();
                    assert_eq!(store.lookup(phys), Some(h));
                    assert_eq!(store.remove(h).unwrap().phys, phys);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert!(store.is_empty());
}
