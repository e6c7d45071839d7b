use tracing::debug;

use super::Region;

/// Scoped guard measuring how much a region grew while it was alive.
pub struct RegionProfiler<'r, 'p> {
    region: &'r Region<'p>,
    name: &'static str,
    start: usize,
}

impl<'r, 'p> RegionProfiler<'r, 'p> {
    pub fn new(region: &'r Region<'p>, name: &'static str) -> Self {
        Self {
            region,
            name,
            start: region.bytes_allocated(),
        }
    }

    pub fn allocated_so_far(&self) -> usize {
        self.region.bytes_allocated() - self.start
    }
}

impl Drop for RegionProfiler<'_, '_> {
    fn drop(&mut self) {
        debug!(
            profiler = self.name,
            bytes = self.allocated_so_far(),
            "region scope finished"
        );
    }
}
