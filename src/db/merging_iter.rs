use std::{cmp::Ordering, iter::Peekable};

use crate::error::Result;

/// Merges several individually sorted, fallible sources. Each step yields
/// every head that compares equal to the lowest one, in source order, so the
/// caller can reduce them into one item.
///
/// The first error from any source is returned and the merge then ends.
pub struct MergingIter<I, T, C>
where
    I: Iterator<Item = Result<T>>,
    C: Fn(&T, &T) -> Ordering,
{
    iters: Vec<Peekable<I>>,
    cmp: C,
    failed: bool,
}

impl<I, T, C> MergingIter<I, T, C>
where
    I: Iterator<Item = Result<T>>,
    C: Fn(&T, &T) -> Ordering,
{
    pub fn new<J>(j: J, cmp: C) -> Self
    where
        J: IntoIterator<Item = I>,
    {
        MergingIter {
            iters: j.into_iter().map(Iterator::peekable).collect(),
            cmp,
            failed: false,
        }
    }

    // Index of the source holding the lowest head. A source whose head is an
    // error wins outright so the error surfaces as early as possible.
    fn lowest(&mut self) -> Option<usize> {
        let mut lowest: Option<(usize, &T)> = None;

        for (idx, it) in self.iters.iter_mut().enumerate() {
            match it.peek() {
                None => {}
                Some(Err(_)) => return Some(idx),
                Some(Ok(k)) => match lowest {
                    None => lowest = Some((idx, k)),
                    Some((_, l)) => {
                        if (self.cmp)(k, l) == Ordering::Less {
                            lowest = Some((idx, k));
                        }
                    }
                },
            }
        }

        lowest.map(|(x, _)| x)
    }
}

impl<I, T, C> Iterator for MergingIter<I, T, C>
where
    I: Iterator<Item = Result<T>>,
    C: Fn(&T, &T) -> Ordering,
{
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let i = self.lowest()?;
        let first = match self.iters[i].next()? {
            Ok(t) => t,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let mut group = vec![first];
        for j in (i + 1)..self.iters.len() {
            let equal = match self.iters[j].peek() {
                Some(Ok(t)) => (self.cmp)(t, &group[0]) == Ordering::Equal,
                Some(Err(_)) => true,
                None => false,
            };
            if equal {
                match self.iters[j].next() {
                    Some(Ok(t)) => group.push(t),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => {}
                }
            }
        }
        Some(Ok(group))
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use rand::Rng;

    use super::MergingIter;
    use crate::error::{Error, Result};

    fn source(v: &[u32]) -> std::vec::IntoIter<Result<u32>> {
        v.iter().map(|x| Ok(*x)).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_groups_equal_heads() {
        let merged: Vec<_> = MergingIter::new(
            [source(&[1, 3, 5]), source(&[2, 3]), source(&[]), source(&[3, 6])],
            |a: &u32, b: &u32| a.cmp(b),
        )
        .collect::<Result<_>>()
        .unwrap();
        assert_eq!(
            merged,
            vec![vec![1], vec![2], vec![3, 3, 3], vec![5], vec![6]]
        );
    }

    #[test]
    fn test_reversed() {
        let merged: Vec<_> = MergingIter::new(
            [source(&[5, 3, 1]), source(&[4, 3])],
            |a: &u32, b: &u32| b.cmp(a),
        )
        .map(|g| g.unwrap()[0])
        .collect();
        assert_eq!(merged, vec![5, 4, 3, 1]);
    }

    #[test]
    fn test_error_ends_merge() {
        let bad = vec![Ok(1), Err(Error::decoding("corrupt")), Ok(9)].into_iter();
        let mut it = MergingIter::new([source(&[0, 2, 4]), bad], |a: &u32, b: &u32| a.cmp(b));
        assert_eq!(it.next().unwrap().unwrap(), vec![0]);
        assert_eq!(it.next().unwrap().unwrap(), vec![1]);
        assert!(matches!(it.next(), Some(Err(Error::Decoding(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn test_random_union() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let n = rng.gen_range(1..6);
            let sources: Vec<BTreeSet<u32>> = (0..n)
                .map(|_| (0..rng.gen_range(0..30)).map(|_| rng.gen_range(0..50)).collect())
                .collect();
            let expected: BTreeSet<u32> = sources.iter().flatten().cloned().collect();
            let merged: Vec<u32> = MergingIter::new(
                sources
                    .iter()
                    .map(|s| s.iter().map(|x| Ok(*x)).collect::<Vec<_>>().into_iter()),
                |a: &u32, b: &u32| a.cmp(b),
            )
            .map(|g| {
                let g = g.unwrap();
                assert!(g.iter().all(|x| *x == g[0]));
                g[0]
            })
            .collect();
            assert_eq!(merged, expected.into_iter().collect::<Vec<_>>());
        }
    }
}
