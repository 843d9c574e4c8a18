use seekpull_core::Region;

/// A set of byte regions kept sorted, with overlapping and adjacent regions
/// merged on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionSet {
    regions: Vec<Region>,
}

impl RegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, region: Region) {
        // first region that could touch `region`
        let start = self
            .regions
            .partition_point(|r| r.end.saturating_add(1) < region.begin);
        let mut merged = region;
        let mut end = start;
        while end < self.regions.len() && self.regions[end].begin <= merged.end.saturating_add(1) {
            merged.begin = merged.begin.min(self.regions[end].begin);
            merged.end = merged.end.max(self.regions[end].end);
            end += 1;
        }
        self.regions.splice(start..end, std::iter::once(merged));
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Bytes covered, counting each byte once.
    pub fn total_size(&self) -> u64 {
        self.regions.iter().map(Region::size).sum()
    }

    /// Smallest single region containing the whole set.
    pub fn super_region(&self) -> Option<Region> {
        let first = self.regions.first()?;
        let last = self.regions.last()?;
        Some(Region::new(first.begin, last.end))
    }
}

impl FromIterator<Region> for RegionSet {
    fn from_iter<I: IntoIterator<Item = Region>>(iter: I) -> Self {
        let mut set = RegionSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<Region> for RegionSet {
    fn extend<I: IntoIterator<Item = Region>>(&mut self, iter: I) {
        for r in iter {
            self.add(r);
        }
    }
}
