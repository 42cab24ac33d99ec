//! Record sources.

use std::error::Error;

/// A forward-only producer of records that owns some closable resource.
///
/// A source handed to [`ExternalSorter`](crate::ExternalSorter) becomes owned by the resulting
/// [`SortedStream`](crate::SortedStream), which closes it exactly once: on
/// [`close`](crate::SortedStream::close), when dropped, or right away if sorting fails before the
/// stream is returned. Callers must not close it themselves.
pub trait RecordSource {
    /// Record type.
    type Item;
    /// Error raised by the source. It is passed through the sorter unchanged.
    type Error: Error;

    /// Returns the next record or `None` when the source is exhausted.
    fn next_record(&mut self) -> Result<Option<Self::Item>, Self::Error>;

    /// Releases the resources held by the source.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// Adapts an iterator of results into a [`RecordSource`] with a no-op `close`.
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I> {
    pub fn new<C>(input: C) -> Self
    where
        C: IntoIterator<IntoIter = I>,
    {
        IterSource {
            inner: input.into_iter(),
        }
    }
}

impl<I, T, E> RecordSource for IterSource<I>
where
    I: Iterator<Item = Result<T, E>>,
    E: Error,
{
    type Item = T;
    type Error = E;

    fn next_record(&mut self) -> Result<Option<T>, E> {
        self.inner.next().transpose()
    }

    fn close(&mut self) -> Result<(), E> {
        Ok(())
    }
}
