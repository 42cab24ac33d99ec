//! Schema-aware sorted feature reader.

use std::error::Error;

use crate::feature::{Feature, FeatureReader, Schema};
use crate::order::{FeatureComparator, FeatureOrdering, OrderingRegistry, SortBy};
use crate::sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortedStream};
use crate::source::RecordSource;

/// Feature reader emitting the features of another reader in sort-by order.
///
/// The sort specification is checked against the wrapped reader schema before anything is read.
/// If it cannot be applied the wrapped reader is closed and [`SortError::InfeasibleSort`] is
/// returned.
pub struct SortedFeatureReader<R>
where
    R: FeatureReader,
{
    schema: Schema,
    stream: SortedStream<R, FeatureOrdering>,
}

impl<R> SortedFeatureReader<R>
where
    R: FeatureReader,
{
    /// Sorts `reader` features keeping at most `page_size` of them in memory, using the default
    /// ordering registry.
    pub fn new(mut reader: R, sort_by: &[SortBy], page_size: usize) -> Result<Self, SortError<R::Error>> {
        let sorter: ExternalSorter<Feature, R::Error> =
            match ExternalSorterBuilder::new().with_page_size(page_size).build() {
                Ok(sorter) => sorter,
                Err(err) => {
                    close_quietly(&mut reader);
                    return Err(err);
                }
            };

        Self::with_sorter(&sorter, reader, sort_by, &OrderingRegistry::default())
    }

    /// Sorts `reader` features with a preconfigured sorter and a custom ordering registry.
    pub fn with_sorter(
        sorter: &ExternalSorter<Feature, R::Error>,
        mut reader: R,
        sort_by: &[SortBy],
        registry: &OrderingRegistry,
    ) -> Result<Self, SortError<R::Error>> {
        let comparator = match FeatureComparator::new(reader.schema(), sort_by, registry) {
            Ok(comparator) => comparator,
            Err(err) => {
                log::error!("features of {} cannot be sorted: {}", reader.schema().name(), err);
                close_quietly(&mut reader);
                return Err(err.into());
            }
        };

        let schema = reader.schema().clone();
        let stream = sorter.sort_by(reader, comparator.into_fn())?;

        return Ok(SortedFeatureReader { schema, stream });
    }

    pub fn has_next(&mut self) -> Result<bool, SortError<R::Error>> {
        self.stream.has_next()
    }

    /// Number of runs spilled to disk while sorting.
    pub fn spilled_runs(&self) -> usize {
        self.stream.spilled_runs()
    }
}

fn close_quietly<R: FeatureReader>(reader: &mut R) {
    if let Err(err) = reader.close() {
        log::warn!("feature reader not closed: {}", err);
    }
}

impl<R> RecordSource for SortedFeatureReader<R>
where
    R: FeatureReader,
    R::Error: 'static,
{
    type Item = Feature;
    type Error = SortError<R::Error>;

    fn next_record(&mut self) -> Result<Option<Feature>, Self::Error> {
        self.stream.next_record()
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.stream.close()
    }
}

impl<R> FeatureReader for SortedFeatureReader<R>
where
    R: FeatureReader,
    R::Error: Error + 'static,
{
    fn schema(&self) -> &Schema {
        &self.schema
    }
}

impl<R> Iterator for SortedFeatureReader<R>
where
    R: FeatureReader,
{
    type Item = Result<Feature, SortError<R::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.stream.next()
    }
}
