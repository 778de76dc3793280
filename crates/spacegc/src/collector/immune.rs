use crate::space::Space;

/// Address ranges a collection treats as wholly live: never marked
/// individually, never swept, never moved.
#[derive(Debug, Default, Clone)]
pub struct ImmuneSpaces {
    ranges: Vec<(usize, usize)>,
}

impl ImmuneSpaces {
    /// No immune ranges.
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Adds `space` up to its limit.
    pub fn add_space(&mut self, space: &dyn Space) {
        self.add_range(space.begin(), space.limit());
    }

    /// Adds `[begin, end)`, merging with an adjacent range.
    pub fn add_range(&mut self, begin: usize, end: usize) {
        if let Some(range) = self
            .ranges
            .iter_mut()
            .find(|(b, e)| *e == begin || *b == end)
        {
            range.0 = range.0.min(begin);
            range.1 = range.1.max(end);
        } else {
            self.ranges.push((begin, end));
        }
    }

    /// Returns `true` if `addr` is inside an immune range.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.ranges.iter().any(|&(b, e)| addr >= b && addr < e)
    }

    /// Forgets every range.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Returns `true` if there are no immune ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The ranges, merged where adjacent.
    #[must_use]
    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }
}
