//! Run buffer: the in-memory page of records collected before a spill.

use std::cmp::Ordering;

use rayon::slice::ParallelSliceMut;

/// Number of records kept in memory per run when no page size is configured.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Run buffer builder.
#[derive(Clone, Debug)]
pub struct RunBufferBuilder {
    page_size: usize,
    preallocate: bool,
}

impl RunBufferBuilder {
    /// Creates a builder of buffers holding at most `page_size` records.
    /// If `preallocate` is set every buffer reserves room for the whole page upfront.
    pub fn new(page_size: usize, preallocate: bool) -> Self {
        RunBufferBuilder { page_size, preallocate }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Creates a new empty buffer.
    pub fn build<T>(&self) -> RunBuffer<T> {
        if self.preallocate {
            RunBuffer::with_capacity(self.page_size)
        } else {
            RunBuffer::new(self.page_size)
        }
    }
}

impl Default for RunBufferBuilder {
    fn default() -> Self {
        RunBufferBuilder {
            page_size: DEFAULT_PAGE_SIZE,
            preallocate: false,
        }
    }
}

/// Buffer limited by records count.
pub struct RunBuffer<T> {
    limit: usize,
    inner: Vec<T>,
}

impl<T> RunBuffer<T> {
    pub fn new(limit: usize) -> Self {
        RunBuffer {
            limit,
            inner: Vec::new(),
        }
    }

    pub fn with_capacity(limit: usize) -> Self {
        RunBuffer {
            limit,
            inner: Vec::with_capacity(limit),
        }
    }

    /// Appends a record. Returns `true` while the buffer still has room for more records,
    /// so a buffer filled exactly to its limit reports `false`.
    pub fn offer(&mut self, item: T) -> bool {
        self.inner.push(item);
        !self.is_full()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the buffer reached the limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    /// Sorts the buffered records. The sort is stable: records the comparator considers equal
    /// keep the order they were offered in.
    pub fn sort_in_place<F>(&mut self, compare: F)
    where
        F: Fn(&T, &T) -> Ordering,
    {
        self.inner.sort_by(compare);
    }

    /// Same as [`RunBuffer::sort_in_place`] but sorts in the provided thread pool.
    pub fn par_sort_in_place<F>(&mut self, thread_pool: &rayon::ThreadPool, compare: F)
    where
        T: Send,
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        let inner = &mut self.inner;
        thread_pool.install(|| inner.par_sort_by(compare));
    }

    /// Consumes the buffer returning its records in their current order.
    pub fn drain(self) -> std::vec::IntoIter<T> {
        self.inner.into_iter()
    }
}
