use serde::{Deserialize, Serialize};

/// Dense, zero-based index of a span within a span index.
pub type SpanId = u32;

/// Inclusive byte range `[begin, end]` in the compressed stream's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region {
    pub begin: u64,
    pub end: u64,
}

impl Region {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end, "region begin {begin} > end {end}");
        Region { begin, end }
    }

    /// Number of bytes covered. Always at least 1.
    pub fn size(&self) -> u64 {
        self.end - self.begin + 1
    }

    /// True if the two regions share a byte or touch end-to-begin.
    pub fn touches(&self, other: &Region) -> bool {
        self.begin <= other.end.saturating_add(1) && other.begin <= self.end.saturating_add(1)
    }

    pub fn contains(&self, other: &Region) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        (begin <= end).then_some(Region { begin, end })
    }

    /// `bytes=a-b` fragment for an HTTP Range header.
    pub fn range_spec(&self) -> String {
        format!("{}-{}", self.begin, self.end)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}

/// Where a file's bytes live inside the uncompressed layer stream.
///
/// Supplied by a metadata provider; the range extractor only consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub uncompressed_offset: u64,
    pub uncompressed_size: u64,
    pub span_start: SpanId,
    pub span_end: SpanId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_regions_touch() {
        let a = Region::new(0, 9);
        assert!(a.touches(&Region::new(10, 20)));
        assert!(a.touches(&Region::new(5, 6)));
        assert!(!a.touches(&Region::new(11, 20)));
    }

    #[test]
    fn intersect_and_size() {
        let a = Region::new(10, 19);
        assert_eq!(a.size(), 10);
        assert_eq!(a.intersect(&Region::new(15, 30)), Some(Region::new(15, 19)));
        assert_eq!(a.intersect(&Region::new(20, 30)), None);
        assert_eq!(a.range_spec(), "10-19");
    }

    proptest::proptest! {
        #[test]
        fn intersection_lies_in_both(a in 0u64..1000, la in 0u64..100, b in 0u64..1000, lb in 0u64..100) {
            let x = Region::new(a, a + la);
            let y = Region::new(b, b + lb);
            match x.intersect(&y) {
                Some(i) => {
                    proptest::prop_assert!(x.contains(&i) && y.contains(&i));
                    proptest::prop_assert!(x.touches(&y));
                }
                None => proptest::prop_assert!(x.end < y.begin || y.end < x.begin),
            }
        }
    }

    #[test]
    fn touches_does_not_overflow_at_u64_max() {
        let a = Region::new(u64::MAX - 1, u64::MAX);
        assert!(a.touches(&Region::new(0, u64::MAX - 2)));
        assert!(!Region::new(0, 1).touches(&Region::new(u64::MAX, u64::MAX)));
    }
}
