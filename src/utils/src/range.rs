#[derive(PartialEq, Eq, Copy, Clone, Default, Hash)]
pub struct Range<T> {
    pub start: T,
    pub end: T,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Range<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x?}, {:#x?})", self.start, self.end)
    }
}

impl<T: num::Integer> Ord for Range<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start.cmp(&other.start)
    }
}

impl<T: num::Integer> PartialOrd for Range<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: num::Integer + Copy> Range<T> {
    pub fn new(start: T, end: T) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn len(&self) -> T {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn overlaps(&self, r: &Self) -> bool {
        self.start < r.end && r.start < self.end
    }

    /// True when splitting at `k` leaves two non-empty halves.
    #[inline]
    pub fn can_split_at(&self, k: T) -> bool {
        self.start < k && k < self.end
    }

    #[inline]
    pub fn contains(&self, k: T) -> bool {
        self.start <= k && k < self.end
    }

    #[inline]
    pub fn is_superset_of(&self, r: &Self) -> bool {
        self.start <= r.start && r.end <= self.end
    }

    #[inline]
    pub fn is_well_formed(&self) -> bool {
        self.start <= self.end
    }
}
