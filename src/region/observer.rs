//! allocation instrumentation hooks for regions
//!
//! observers see region construction, every allocation with its call site,
//! and destruction. they never influence what the region hands out

use core::panic::Location;

use rust_alloc::string::String;
use rust_alloc::vec::Vec;
use spin::Mutex;
use tracing::info;

use crate::FxHashMap;

/// Call site of a region allocation, captured through `#[track_caller]`.
pub type AllocationSite = &'static Location<'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Heap,
    Stack,
}

/// Identifier an observer hands out for each region it watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionToken(u64);

impl RegionToken {
    pub const UNTRACKED: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

pub trait RegionObserver {
    fn region_created(&self, kind: RegionKind) -> RegionToken;

    fn region_allocated(&self, token: RegionToken, bytes: usize, site: AllocationSite);

    fn region_destroyed(&self, token: RegionToken, bytes_allocated: usize);
}

/// Which region kinds get per call site byte totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiteCollection {
    #[default]
    Off,
    HeapOnly,
    StackOnly,
    All,
}

impl SiteCollection {
    fn collects(self, kind: RegionKind) -> bool {
        match self {
            Self::Off => false,
            Self::HeapOnly => kind == RegionKind::Heap,
            Self::StackOnly => kind == RegionKind::Stack,
            Self::All => true,
        }
    }
}

/// What an [`AllocationLog`] knows about one region.
#[derive(Debug, Clone)]
pub struct RegionLog {
    pub token: RegionToken,
    pub kind: RegionKind,
    pub label: Option<String>,
    /// logical time of construction
    pub start_time: u64,
    /// logical time of destruction, `None` while the region is alive
    pub end_time: Option<u64>,
    pub bytes_allocated: usize,
    pub sites: FxHashMap<AllocationSite, usize>,
}

impl RegionLog {
    /// Call sites ordered by bytes allocated, largest first.
    pub fn sites_by_bytes(&self) -> Vec<(AllocationSite, usize)> {
        let mut sites: Vec<_> = self.sites.iter().map(|(site, bytes)| (*site, *bytes)).collect();
        sites.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.line().cmp(&b.0.line())));
        sites
    }
}

#[derive(Default)]
struct LogState {
    clock: u64,
    next_token: u64,
    live: FxHashMap<RegionToken, RegionLog>,
    finished: Vec<RegionLog>,
}

impl LogState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// [`RegionObserver`] keeping a log entry per region, finished entries are
/// kept in destruction order.
#[derive(Default)]
pub struct AllocationLog {
    collection: SiteCollection,
    state: Mutex<LogState>,
}

impl AllocationLog {
    pub fn new(collection: SiteCollection) -> Self {
        Self {
            collection,
            state: Mutex::new(LogState::default()),
        }
    }

    pub fn collection(&self) -> SiteCollection {
        self.collection
    }

    /// Attach a label (e.g. the method being compiled) to a live region.
    pub fn label(&self, token: RegionToken, label: impl Into<String>) {
        if let Some(log) = self.state.lock().live.get_mut(&token) {
            log.label = Some(label.into());
        }
    }

    pub fn live_regions(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn finished(&self) -> Vec<RegionLog> {
        self.state.lock().finished.clone()
    }

    pub fn clear(&self) {
        self.state.lock().finished.clear();
    }

    /// Emit every finished region and its call sites as `info` events.
    pub fn report(&self) {
        let state = self.state.lock();
        for log in &state.finished {
            info!(
                token = log.token.get(),
                kind = ?log.kind,
                label = log.label.as_deref().unwrap_or(""),
                start = log.start_time,
                end = log.end_time.unwrap_or(0),
                bytes = log.bytes_allocated,
                "region allocations"
            );
            for (site, bytes) in log.sites_by_bytes() {
                info!(
                    token = log.token.get(),
                    file = site.file(),
                    line = site.line(),
                    bytes,
                    "allocation site"
                );
            }
        }
    }
}

impl RegionObserver for AllocationLog {
    fn region_created(&self, kind: RegionKind) -> RegionToken {
        let mut state = self.state.lock();
        state.next_token += 1;
        let token = RegionToken(state.next_token);
        let start_time = state.tick();
        state.live.insert(
            token,
            RegionLog {
                token,
                kind,
                label: None,
                start_time,
                end_time: None,
                bytes_allocated: 0,
                sites: FxHashMap::default(),
            },
        );
        token
    }

    fn region_allocated(&self, token: RegionToken, bytes: usize, site: AllocationSite) {
        let collection = self.collection;
        let mut state = self.state.lock();
        let Some(log) = state.live.get_mut(&token) else {
            return;
        };
        log.bytes_allocated += bytes;
        if collection.collects(log.kind) {
            *log.sites.entry(site).or_insert(0) += bytes;
        }
    }

    fn region_destroyed(&self, token: RegionToken, bytes_allocated: usize) {
        let mut state = self.state.lock();
        let end_time = state.tick();
        if let Some(mut log) = state.live.remove(&token) {
            // the region may have allocated before the log was attached
            log.bytes_allocated = log.bytes_allocated.max(bytes_allocated);
            log.end_time = Some(end_time);
            state.finished.push(log);
        }
    }
}
