//! Binary heap merger.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Merge frontier entry: the current head of one input.
struct HeadItem<T, F> {
    item: T,
    idx: usize,
    compare: Arc<F>,
}

impl<T, F> Ord for HeadItem<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    // binary heap is max-heap by default so the order is reversed to convert it to min-heap
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(&other.item, &self.item).then_with(|| other.idx.cmp(&self.idx))
    }
}

impl<T, F> PartialOrd for HeadItem<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, F> PartialEq for HeadItem<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, F> Eq for HeadItem<T, F> where F: Fn(&T, &T) -> Ordering {}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// Items the comparator considers equal are emitted in input index order, so the merge of
/// inputs holding consecutive slices of a stably sorted sequence is stable too.
/// The merger holds at most one item per input. The first input error is returned once,
/// after that the merger is exhausted.
pub struct BinaryHeapMerger<T, E, F, C>
where
    C: Iterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
{
    items: BinaryHeap<HeadItem<T, F>>,
    chunks: Vec<C>,
    compare: Arc<F>,
    /// Input error raised while refilling the frontier, reported after the popped item.
    pending_error: Option<E>,
    initiated: bool,
    failed: bool,
}

impl<T, E, F, C> BinaryHeapMerger<T, E, F, C>
where
    C: Iterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted according to `compare` otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    /// * `compare` - Function used to compare items
    pub fn new<I>(chunks: I, compare: F) -> Self
    where
        I: IntoIterator,
        I::Item: IntoIterator<IntoIter = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|c| c.into_iter()));
        let items = BinaryHeap::with_capacity(chunks.len());

        return BinaryHeapMerger {
            chunks,
            items,
            compare: Arc::new(compare),
            pending_error: None,
            initiated: false,
            failed: false,
        };
    }

    /// Number of inputs still having items.
    pub fn live_chunks(&self) -> usize {
        if self.initiated {
            self.items.len()
        } else {
            self.chunks.len()
        }
    }

    fn pull(&mut self, idx: usize) -> Result<(), E> {
        if let Some(item) = self.chunks[idx].next() {
            self.items.push(HeadItem {
                item: item?,
                idx,
                compare: Arc::clone(&self.compare),
            });
        }

        return Ok(());
    }

    fn fail(&mut self, err: E) -> Option<Result<T, E>> {
        self.failed = true;
        self.items.clear();
        self.chunks.clear();

        return Some(Err(err));
    }
}

impl<T, E, F, C> Iterator for BinaryHeapMerger<T, E, F, C>
where
    C: Iterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in the comparator order.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(err) = self.pending_error.take() {
            return self.fail(err);
        }

        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.chunks.len() {
                if let Err(err) = self.pull(idx) {
                    return self.fail(err);
                }
            }
        }

        let head = self.items.pop()?;
        if let Err(err) = self.pull(head.idx) {
            self.pending_error = Some(err);
        }

        return Some(Ok(head.item));
    }
}
