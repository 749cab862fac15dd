//! Counting mocks of the collaborators a pool is wired to.

#![allow(dead_code)]

use gpu_page_meta::{DmaAddress, PageHandle, PageMetadataStore, PhysicalAddress};
use gpu_page_pool::{
    Clock, DeferralRegistry, DeviceContext, MigrationTracker, OwnerId, PageProvider,
    ReclaimSubsystem, SecureWindow, Shrinker, ShrinkerId, sequence_reached,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Hook = Box<dyn Fn() + Send + Sync>;

/// OS page allocator backed by the device's metadata store.
pub struct MockProvider {
    store: Arc<PageMetadataStore>,
    next_pfn: Mutex<u64>,
    /// Fetches still allowed to succeed.
    budget: AtomicUsize,
    terminating: Mutex<Vec<OwnerId>>,
    on_fetch: Mutex<Option<Hook>>,
    on_sync: Mutex<Option<Hook>>,
    pub fetches: AtomicUsize,
    pub releases: AtomicUsize,
    pub syncs: AtomicUsize,
}

impl MockProvider {
    pub fn new(store: Arc<PageMetadataStore>) -> Self {
        Self {
            store,
            next_pfn: Mutex::new(0x10_0000),
            budget: AtomicUsize::new(usize::MAX),
            terminating: Mutex::new(Vec::new()),
            on_fetch: Mutex::new(None),
            on_sync: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
        }
    }

    /// Lets only the next `n` fetches succeed.
    pub fn fail_after(&self, n: usize) {
        self.budget.store(n, Ordering::SeqCst);
    }

    pub fn terminate_owner(&self, owner: OwnerId) {
        self.terminating.lock().unwrap().push(owner);
    }

    /// Runs `hook` on every fetch, before the page is handed out.
    pub fn on_fetch(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_fetch.lock().unwrap() = Some(Box::new(hook));
    }

    /// Runs `hook` on every cache sync.
    pub fn on_sync(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_sync.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl PageProvider for MockProvider {
    fn fetch(&self, group_id: u8, order: u8) -> Option<PageHandle> {
        if let Some(hook) = self.on_fetch.lock().unwrap().as_ref() {
            hook();
        }
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;

        let pfn = {
            let mut next = self.next_pfn.lock().unwrap();
            let size = 1u64 << order;
            let pfn = next.next_multiple_of(size);
            *next = pfn + size;
            pfn
        };
        let phys = PhysicalAddress::from_pfn(pfn);
        let dma = DmaAddress::new(phys.as_u64() | 1 << 40);
        let page = self.store.insert(phys, dma, order, group_id).ok()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Some(page)
    }

    fn release(&self, page: PageHandle) {
        let removed = self.store.remove(page);
        assert!(removed.is_ok(), "{page:?} released twice");
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_for_device(&self, _page: PageHandle) {
        if let Some(hook) = self.on_sync.lock().unwrap().as_ref() {
            hook();
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
    }

    fn can_request_allocation(&self, owner: OwnerId) -> bool {
        !self.terminating.lock().unwrap().contains(&owner)
    }
}

/// Scriptable secure-window scheduler.
pub struct MockSecureWindow {
    required: AtomicBool,
    current: AtomicU64,
    completed: AtomicU64,
    pub progress_timeout_ms: u64,
    pub reset_timeout_ms: u64,
}

impl MockSecureWindow {
    pub fn new() -> Self {
        Self {
            required: AtomicBool::new(false),
            current: AtomicU64::new(1),
            completed: AtomicU64::new(0),
            progress_timeout_ms: 100,
            reset_timeout_ms: 50,
        }
    }

    /// Enters (or leaves) a secure window numbered `seq`.
    pub fn enter(&self, seq: u64) {
        self.current.store(seq, Ordering::SeqCst);
        self.required.store(true, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.required.store(false, Ordering::SeqCst);
    }

    pub fn complete(&self, seq: u64) {
        self.completed.store(seq, Ordering::SeqCst);
    }
}

impl SecureWindow for MockSecureWindow {
    fn deferral_required(&self) -> bool {
        self.required.load(Ordering::SeqCst)
    }

    fn current_sequence(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    fn sequence_completed(&self, seq: u64) -> bool {
        sequence_reached(self.completed.load(Ordering::SeqCst), seq)
    }

    fn progress_timeout_ms(&self) -> u64 {
        self.progress_timeout_ms
    }

    fn reset_timeout_ms(&self) -> u64 {
        self.reset_timeout_ms
    }
}

/// Clock that only advances when a waiter relaxes.
#[derive(Default)]
pub struct MockClock {
    now: AtomicU64,
    pub relaxes: AtomicUsize,
}

impl MockClock {
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn relaxes(&self) -> usize {
        self.relaxes.load(Ordering::SeqCst)
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn relax(&self) {
        self.now.fetch_add(1, Ordering::SeqCst);
        self.relaxes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Isolations that finish one at a time, one per query.
#[derive(Default)]
pub struct MockMigration {
    isolating: AtomicUsize,
    pub queries: AtomicUsize,
}

impl MockMigration {
    pub fn set_isolating(&self, n: usize) {
        self.isolating.store(n, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl MigrationTracker for MockMigration {
    fn isolation_in_progress_count(&self) -> usize {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.isolating
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0)
    }
}

/// Reclaim subsystem recording live shrinkers.
#[derive(Default)]
pub struct MockReclaim {
    next_id: AtomicU64,
    live: Mutex<Vec<(ShrinkerId, Arc<dyn Shrinker>)>>,
    pub unregistered: Mutex<Vec<ShrinkerId>>,
}

impl MockReclaim {
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn shrinker(&self, index: usize) -> Arc<dyn Shrinker> {
        Arc::clone(&self.live.lock().unwrap()[index].1)
    }

    pub fn was_unregistered(&self, id: ShrinkerId) -> bool {
        self.unregistered.lock().unwrap().contains(&id)
    }
}

impl ReclaimSubsystem for MockReclaim {
    fn register(&self, shrinker: Arc<dyn Shrinker>) -> ShrinkerId {
        let id = ShrinkerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().push((id, shrinker));
        id
    }

    fn unregister(&self, id: ShrinkerId) {
        self.live.lock().unwrap().retain(|(s, _)| *s != id);
        self.unregistered.lock().unwrap().push(id);
    }
}

/// One mock device.
pub struct Harness {
    pub store: Arc<PageMetadataStore>,
    pub provider: Arc<MockProvider>,
    pub secure: Arc<MockSecureWindow>,
    pub clock: Arc<MockClock>,
    pub migration: Arc<MockMigration>,
    pub reclaim: Arc<MockReclaim>,
    pub registry: Arc<DeferralRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(PageMetadataStore::with_capacity(8192));
        Self {
            provider: Arc::new(MockProvider::new(Arc::clone(&store))),
            store,
            secure: Arc::new(MockSecureWindow::new()),
            clock: Arc::new(MockClock::default()),
            migration: Arc::new(MockMigration::default()),
            reclaim: Arc::new(MockReclaim::default()),
            registry: Arc::new(DeferralRegistry::new()),
        }
    }

    pub fn device(&self) -> DeviceContext {
        DeviceContext {
            pages: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider) as Arc<dyn PageProvider>,
            secure: Arc::clone(&self.secure) as Arc<dyn SecureWindow>,
            migration: Arc::clone(&self.migration) as Arc<dyn MigrationTracker>,
            clock: Arc::clone(&self.clock) as Arc<dyn Clock>,
            deferral: Arc::clone(&self.registry),
            reclaim: Some(Arc::clone(&self.reclaim) as Arc<dyn ReclaimSubsystem>),
        }
    }

    /// Same device without a reclaim hook.
    pub fn device_without_reclaim(&self) -> DeviceContext {
        DeviceContext {
            reclaim: None,
            ..self.device()
        }
    }
}
