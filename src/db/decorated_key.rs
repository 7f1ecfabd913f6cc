use std::{
    fmt,
    ops::{Bound, RangeBounds},
};

use bytes::Bytes;

/// A partition key together with its placement token. Partitions are ordered
/// by token; keys are byte-ordered, so the token is the key itself.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DecoratedKey {
    key: Bytes,
}

impl DecoratedKey {
    pub fn new<B: Into<Bytes>>(key: B) -> Self {
        DecoratedKey { key: key.into() }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn token(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for DecoratedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.key))
    }
}

/// A range of partitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<DecoratedKey>,
    pub end: Bound<DecoratedKey>,
}

impl KeyRange {
    pub fn all() -> Self {
        KeyRange {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    pub fn single(key: DecoratedKey) -> Self {
        KeyRange {
            start: Bound::Included(key.clone()),
            end: Bound::Included(key),
        }
    }

    pub fn new(start: Bound<DecoratedKey>, end: Bound<DecoratedKey>) -> Self {
        KeyRange { start, end }
    }

    /// Whether the range could overlap `[min, max]`.
    pub fn intersects(&self, min: &DecoratedKey, max: &DecoratedKey) -> bool {
        let after_start = match &self.start {
            Bound::Unbounded => true,
            Bound::Included(s) => max >= s,
            Bound::Excluded(s) => max > s,
        };
        let before_end = match &self.end {
            Bound::Unbounded => true,
            Bound::Included(e) => min <= e,
            Bound::Excluded(e) => min < e,
        };
        after_start && before_end
    }
}

impl RangeBounds<DecoratedKey> for KeyRange {
    fn start_bound(&self) -> Bound<&DecoratedKey> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&DecoratedKey> {
        self.end.as_ref()
    }
}

#[cfg(test)]
mod test {
    use std::ops::{Bound, RangeBounds};

    use super::{DecoratedKey, KeyRange};

    #[test]
    fn test_key_range() {
        let k = |s: &'static str| DecoratedKey::new(s.as_bytes());
        let r = KeyRange::new(Bound::Excluded(k("b")), Bound::Included(k("d")));
        assert!(!r.contains(&k("b")));
        assert!(r.contains(&k("c")));
        assert!(r.contains(&k("d")));
        assert!(!r.contains(&k("e")));

        assert!(r.intersects(&k("a"), &k("c")));
        assert!(!r.intersects(&k("a"), &k("b")));
        assert!(r.intersects(&k("d"), &k("z")));
        assert!(!r.intersects(&k("e"), &k("z")));
        assert!(KeyRange::all().intersects(&k(""), &k("")));
    }
}
