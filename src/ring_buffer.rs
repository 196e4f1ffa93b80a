#![warn(clippy::pedantic)]

/// Fixed-capacity history of the most recent readings, oldest first. Capacity is always a power
/// of two so the write cursor wraps with a mask; once full, every push overwrites the oldest
/// entry. Unlike a zero-initialised buffer, only readings actually pushed are ever yielded.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone)]
pub struct SampleRing<T: Copy> {
    mask: usize,
    next: usize,
    filled: usize,
    data: Vec<T>,
}

impl<T: Copy> SampleRing<T> {
    /// Room for `2^exponent` readings; `None` for exponents above 20.
    #[must_use]
    pub fn with_exponent(exponent: u32) -> Option<Self> {
        if exponent > 20 {
            return None;
        }
        let capacity = 1usize << exponent;
        Some(SampleRing {
            mask: capacity - 1,
            next: 0,
            filled: 0,
            data: Vec::with_capacity(capacity),
        })
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.filled
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn push(&mut self, val: T) {
        if self.data.len() < self.capacity() {
            self.data.push(val);
        } else {
            self.data[self.next] = val;
        }
        self.next = (self.next + 1) & self.mask;
        self.filled = (self.filled + 1).min(self.capacity());
    }

    /// Oldest to newest.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, T> {
        self.last_n(self.filled)
    }

    /// The newest `num` readings (or all of them, if fewer), oldest first.
    #[must_use]
    pub fn last_n(&self, num: usize) -> Iter<'_, T> {
        let num = num.min(self.filled);
        Iter {
            ring: self,
            offset: self.filled - num,
        }
    }
}

pub struct Iter<'a, T: Copy> {
    ring: &'a SampleRing<T>,
    offset: usize,
}

impl<'a, T: Copy> Iterator for Iter<'a, T> {
    type Item = T;
    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.ring.filled {
            return None;
        }
        // the oldest reading sits at `next` once the ring has wrapped, at 0 before that
        let start = if self.ring.filled == self.ring.capacity() {
            self.ring.next
        } else {
            0
        };
        let val = self.ring.data[(start + self.offset) & self.ring.mask];
        self.offset += 1;
        Some(val)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.ring.filled - self.offset.min(self.ring.filled);
        (left, Some(left))
    }
}

impl<'a, T: Copy> ExactSizeIterator for Iter<'a, T> {}

impl<'a, T: Copy> IntoIterator for &'a SampleRing<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;
    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
