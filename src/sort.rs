//! External sorter.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use crate::buffer::{RunBuffer, RunBufferBuilder};
use crate::merger::BinaryHeapMerger;
use crate::order::InfeasibleSort;
use crate::source::{IterSource, RecordSource};
use crate::spill::{RmpFormat, SpillError, SpillFormat, SpillHandle, SpillReader, SpillStore};

/// Sorting error.
#[derive(Debug)]
pub enum SortError<I: Error> {
    /// Sort specification cannot be applied to the input.
    InfeasibleSort(InfeasibleSort),
    /// Page size of zero records.
    InvalidPageSize,
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Sorted run persisting error.
    SpillWrite(SpillError),
    /// Sorted run reading error.
    SpillRead(SpillError),
    /// Spill files removal error.
    Cleanup(io::Error),
    /// The sorted stream has already been closed.
    UsedAfterClose,
    /// Input data stream error.
    InputError(I),
}

impl<I: Error> SortError<I> {
    /// Checks if a spilled run was found truncated or corrupted.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, SortError::SpillRead(SpillError::Decode(_)))
    }
}

impl<I> Error for SortError<I>
where
    I: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::InfeasibleSort(err) => Some(err),
            SortError::InvalidPageSize => None,
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::SpillWrite(err) => Some(err),
            SortError::SpillRead(err) => Some(err),
            SortError::Cleanup(err) => Some(err),
            SortError::UsedAfterClose => None,
            SortError::InputError(err) => Some(err),
        }
    }
}

impl<I: Error> Display for SortError<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InfeasibleSort(err) => write!(f, "sort is not feasible: {}", err),
            SortError::InvalidPageSize => write!(f, "page size must be at least one record"),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::SpillWrite(err) => write!(f, "sorted run not saved: {}", err),
            SortError::SpillRead(err) => write!(f, "sorted run not read: {}", err),
            SortError::Cleanup(err) => write!(f, "spill files not removed: {}", err),
            SortError::UsedAfterClose => write!(f, "sorted stream used after close"),
            SortError::InputError(err) => write!(f, "input data stream error: {}", err),
        }
    }
}

impl<I: Error> From<InfeasibleSort> for SortError<I> {
    fn from(err: InfeasibleSort) -> Self {
        SortError::InfeasibleSort(err)
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<T, E, C = RmpFormat>
where
    T: Send,
    E: Error,
    C: SpillFormat<T>,
{
    /// Number of threads to be used to sort runs in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Spill file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Run buffer builder.
    buffer_builder: RunBufferBuilder,
    /// Number of sorted records to skip.
    offset: usize,
    /// Maximum number of records to emit.
    limit: Option<usize>,

    /// Spill format type.
    spill_format_type: PhantomData<C>,
    /// Input item type.
    item_type: PhantomData<T>,
    /// Input error type.
    input_error_type: PhantomData<E>,
}

impl<T, E, C> ExternalSorterBuilder<T, E, C>
where
    T: Send,
    E: Error,
    C: SpillFormat<T>,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<T, E, C>, SortError<E>> {
        let mut sorter = ExternalSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.buffer_builder,
            self.rw_buf_size,
        )?;
        sorter.offset = self.offset;
        sorter.limit = self.limit;

        return Ok(sorter);
    }

    /// Sets number of threads to be used to sort runs in parallel.
    /// By default runs are sorted in the calling thread.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<T, E, C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<T, E, C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets run buffer builder.
    pub fn with_buffer(mut self, buffer_builder: RunBufferBuilder) -> ExternalSorterBuilder<T, E, C> {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets the number of records sorted in memory before a run is spilled to disk.
    pub fn with_page_size(mut self, page_size: usize) -> ExternalSorterBuilder<T, E, C> {
        self.buffer_builder = RunBufferBuilder::new(page_size, false);
        return self;
    }

    /// Sets spill file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<T, E, C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets the number of leading sorted records to be discarded.
    pub fn with_offset(mut self, offset: usize) -> ExternalSorterBuilder<T, E, C> {
        self.offset = offset;
        return self;
    }

    /// Sets the maximum number of records to be emitted after the offset.
    pub fn with_limit(mut self, limit: usize) -> ExternalSorterBuilder<T, E, C> {
        self.limit = Some(limit);
        return self;
    }
}

impl<T, E, C> Default for ExternalSorterBuilder<T, E, C>
where
    T: Send,
    E: Error,
    C: SpillFormat<T>,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            buffer_builder: RunBufferBuilder::default(),
            offset: 0,
            limit: None,
            spill_format_type: PhantomData,
            item_type: PhantomData,
            input_error_type: PhantomData,
        }
    }
}

/// External sorter.
///
/// The sorter only holds configuration, every [`ExternalSorter::sort_by`] call creates its own
/// temporary directory so sorted streams never share spill files.
pub struct ExternalSorter<T, E, C = RmpFormat>
where
    T: Send,
    E: Error,
    C: SpillFormat<T>,
{
    /// Sorting thread pool.
    thread_pool: Option<rayon::ThreadPool>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Run buffer builder.
    buffer_builder: RunBufferBuilder,
    /// Spill file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Number of sorted records to skip.
    offset: usize,
    /// Maximum number of records to emit.
    limit: Option<usize>,

    /// Spill format type.
    spill_format_type: PhantomData<C>,
    /// Input item type.
    item_type: PhantomData<T>,
    /// Input error type.
    input_error_type: PhantomData<E>,
}

impl<T, E, C> ExternalSorter<T, E, C>
where
    T: Send,
    E: Error,
    C: SpillFormat<T>,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort runs in parallel. If the parameter is [`None`]
    ///   runs are sorted in the calling thread.
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `buffer_builder` - An instance of a buffer builder that will be used for run buffer creation.
    /// * `rw_buf_size` - Spill files read/write buffer size.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        buffer_builder: RunBufferBuilder,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, SortError<E>> {
        if buffer_builder.page_size() == 0 {
            return Err(SortError::InvalidPageSize);
        }

        return Ok(ExternalSorter {
            rw_buf_size,
            buffer_builder,
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: tmp_path.map(Into::into),
            offset: 0,
            limit: None,
            spill_format_type: PhantomData,
            item_type: PhantomData,
            input_error_type: PhantomData,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<Option<rayon::ThreadPool>, SortError<E>> {
        let threads_number = match threads_number {
            Some(threads_number) => threads_number,
            None => return Ok(None),
        };

        log::info!("initializing thread-pool (threads: {})", threads_number);
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads_number)
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(Some(thread_pool));
    }

    /// Sorts records from the source in their natural order.
    /// Returns a stream that can be used to get sorted records.
    ///
    /// # Arguments
    /// * `source` - Record source to be sorted. The returned stream takes care of closing it.
    pub fn sort<S>(&self, source: S) -> Result<SortedStream<S, fn(&T, &T) -> Ordering, C>, SortError<E>>
    where
        T: Ord,
        S: RecordSource<Item = T, Error = E>,
    {
        self.sort_by(source, T::cmp as fn(&T, &T) -> Ordering)
    }

    /// Sorts records from the source using a custom compare function.
    /// Returns a stream that can be used to get sorted records.
    ///
    /// Records are read and sorted, runs overflowing the page size are spilled to disk and the
    /// offset is skipped before this method returns. If anything fails on the way the spill files
    /// are removed and the source is closed.
    ///
    /// # Arguments
    /// * `source` - Record source to be sorted. The returned stream takes care of closing it.
    /// * `compare` - Function to be used to compare records
    pub fn sort_by<S, F>(&self, mut source: S, compare: F) -> Result<SortedStream<S, F, C>, SortError<E>>
    where
        S: RecordSource<Item = T, Error = E>,
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        let mut store = SpillStore::new(self.tmp_dir.as_deref(), self.rw_buf_size);

        let (state, spilled_runs) = match self.fill(&mut source, &mut store, &compare) {
            Ok(Filled::Memory(items)) => (State::Memory(items), 0),
            Ok(Filled::Runs(runs)) => {
                let spilled_runs = runs.len() - 1;
                (State::Merging(BinaryHeapMerger::new(runs, compare)), spilled_runs)
            }
            Err(err) => {
                if let Err(cleanup_err) = store.close() {
                    log::warn!("spill files cleanup failed: {}", cleanup_err);
                }
                if let Err(close_err) = source.close() {
                    log::warn!("record source not closed: {}", close_err);
                }
                return Err(err);
            }
        };

        let mut stream = SortedStream {
            state,
            store,
            source: Some(source),
            peeked: None,
            remaining: None,
            spilled_runs,
        };

        if self.offset > 0 {
            log::debug!("skipping {} sorted records", self.offset);
            for _ in 0..self.offset {
                if stream.advance()?.is_none() {
                    break;
                }
            }
        }
        stream.remaining = self.limit;

        return Ok(stream);
    }

    /// Sorts data from the input in its natural order.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    pub fn sort_iter<I>(
        &self,
        input: I,
    ) -> Result<SortedStream<IterSource<I::IntoIter>, fn(&T, &T) -> Ordering, C>, SortError<E>>
    where
        T: Ord,
        I: IntoIterator<Item = Result<T, E>>,
    {
        self.sort(IterSource::new(input))
    }

    /// Sorts data from the input using a custom compare function.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    /// * `compare` - Function to be used to compare items
    pub fn sort_iter_by<I, F>(
        &self,
        input: I,
        compare: F,
    ) -> Result<SortedStream<IterSource<I::IntoIter>, F, C>, SortError<E>>
    where
        I: IntoIterator<Item = Result<T, E>>,
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        self.sort_by(IterSource::new(input), compare)
    }

    fn fill<S, F>(&self, source: &mut S, store: &mut SpillStore<T, C>, compare: &F) -> Result<Filled<T, C>, SortError<E>>
    where
        S: RecordSource<Item = T, Error = E>,
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        let mut run_buf = self.buffer_builder.build();
        let mut handles = Vec::new();

        while let Some(item) = source.next_record().map_err(SortError::InputError)? {
            if !run_buf.offer(item) {
                handles.push(self.spill_run(run_buf, store, compare)?);
                run_buf = self.buffer_builder.build();
            }
        }

        self.sort_run(&mut run_buf, compare);

        if handles.is_empty() {
            log::debug!("external sort preparation done, {} records sorted in memory", run_buf.len());
            return Ok(Filled::Memory(run_buf.drain()));
        }

        log::debug!(
            "external sort preparation done, merging {} spilled runs and {} records in memory",
            handles.len(),
            run_buf.len()
        );

        let mut runs = Vec::with_capacity(handles.len() + 1);
        for handle in &handles {
            let reader = store.open_reader(handle).map_err(SortError::SpillRead)?;
            runs.push(RunReader::Spill(reader.dispose_on_exhaust()));
        }
        runs.push(RunReader::Memory(run_buf.drain()));

        return Ok(Filled::Runs(runs));
    }

    fn sort_run<F>(&self, run_buf: &mut RunBuffer<T>, compare: &F)
    where
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        match &self.thread_pool {
            Some(thread_pool) => run_buf.par_sort_in_place(thread_pool, compare),
            None => run_buf.sort_in_place(compare),
        }
    }

    fn spill_run<F>(
        &self,
        mut run_buf: RunBuffer<T>,
        store: &mut SpillStore<T, C>,
        compare: &F,
    ) -> Result<SpillHandle, SortError<E>>
    where
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        log::debug!("sorting run data ({} records) ...", run_buf.len());
        self.sort_run(&mut run_buf, compare);

        log::debug!("saving run data");
        let handle = store.write(run_buf.drain()).map_err(|err| match err {
            SpillError::TempDir(err) => SortError::TempDir(err),
            err => SortError::SpillWrite(err),
        })?;

        return Ok(handle);
    }
}

/// Outcome of the filling phase.
enum Filled<T, C> {
    /// Everything fit in one page.
    Memory(std::vec::IntoIter<T>),
    /// Spilled runs in spill order followed by the last in-memory run.
    Runs(Vec<RunReader<T, C>>),
}

/// Sorted run being merged.
enum RunReader<T, C> {
    Memory(std::vec::IntoIter<T>),
    Spill(SpillReader<T, C>),
}

impl<T, C> Iterator for RunReader<T, C>
where
    C: SpillFormat<T>,
{
    type Item = Result<T, SpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RunReader::Memory(items) => items.next().map(Ok),
            RunReader::Spill(reader) => reader.next(),
        }
    }
}

enum State<T, F, C>
where
    F: Fn(&T, &T) -> Ordering,
    C: SpillFormat<T>,
{
    /// The whole input fit in one page.
    Memory(std::vec::IntoIter<T>),
    Merging(BinaryHeapMerger<T, SpillError, F, RunReader<T, C>>),
    Exhausted,
    Closed,
}

/// Sorted stream produced by an [`ExternalSorter`].
///
/// The stream owns the record source and the spill files of the sort. Both are released by
/// [`SortedStream::close`], or on drop if the stream was never closed. Any call made after
/// `close` fails with [`SortError::UsedAfterClose`].
///
/// A spill read failure ends the stream: the error is returned once and the spill files are
/// removed right away.
pub struct SortedStream<S, F, C = RmpFormat>
where
    S: RecordSource,
    F: Fn(&S::Item, &S::Item) -> Ordering,
    C: SpillFormat<S::Item>,
{
    state: State<S::Item, F, C>,
    store: SpillStore<S::Item, C>,
    source: Option<S>,
    peeked: Option<S::Item>,
    /// Records left to emit when a limit is set.
    remaining: Option<usize>,
    spilled_runs: usize,
}

impl<S, F, C> SortedStream<S, F, C>
where
    S: RecordSource,
    F: Fn(&S::Item, &S::Item) -> Ordering,
    C: SpillFormat<S::Item>,
{
    /// Checks if there are records left, reading ahead one record if needed.
    pub fn has_next(&mut self) -> Result<bool, SortError<S::Error>> {
        if self.peeked.is_none() {
            self.peeked = self.advance()?;
        }

        return Ok(self.peeked.is_some());
    }

    /// Returns the next sorted record or `None` when all of them have been emitted.
    pub fn next_record(&mut self) -> Result<Option<S::Item>, SortError<S::Error>> {
        match self.peeked.take() {
            Some(item) => Ok(Some(item)),
            None => self.advance(),
        }
    }

    /// Number of runs spilled to disk. Zero means the input was sorted in memory.
    pub fn spilled_runs(&self) -> usize {
        self.spilled_runs
    }

    pub fn is_in_memory(&self) -> bool {
        self.spilled_runs == 0
    }

    /// Removes the spill files and closes the record source.
    pub fn close(&mut self) -> Result<(), SortError<S::Error>> {
        if let State::Closed = self.state {
            return Err(SortError::UsedAfterClose);
        }

        self.state = State::Closed;
        self.peeked = None;

        let disposed = self.store.close();
        let closed = match self.source.take() {
            Some(mut source) => source.close(),
            None => Ok(()),
        };

        closed.map_err(SortError::InputError)?;
        disposed.map_err(SortError::Cleanup)?;

        return Ok(());
    }

    fn advance(&mut self) -> Result<Option<S::Item>, SortError<S::Error>> {
        if self.remaining == Some(0) {
            return match self.state {
                State::Closed => Err(SortError::UsedAfterClose),
                _ => Ok(None),
            };
        }

        let result = match &mut self.state {
            State::Closed => return Err(SortError::UsedAfterClose),
            State::Exhausted => Ok(None),
            State::Memory(items) => Ok(items.next()),
            State::Merging(merger) => merger.next().transpose(),
        };

        match result {
            Ok(Some(item)) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                    if *remaining == 0 {
                        self.finish();
                    }
                }
                Ok(Some(item))
            }
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(err) => {
                log::error!("sorted run reading failed: {}", err);
                self.finish();
                Err(SortError::SpillRead(err))
            }
        }
    }

    /// Drops the merge inputs and removes the spill files, leaving the record source open.
    fn finish(&mut self) {
        if let State::Exhausted = self.state {
            return;
        }

        self.state = State::Exhausted;
        if let Err(err) = self.store.close() {
            log::warn!("spill files cleanup failed: {}", err);
        }
    }
}

impl<S, F, C> Iterator for SortedStream<S, F, C>
where
    S: RecordSource,
    F: Fn(&S::Item, &S::Item) -> Ordering,
    C: SpillFormat<S::Item>,
{
    type Item = Result<S::Item, SortError<S::Error>>;

    /// Returns the next sorted record.
    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

impl<S, F, C> Drop for SortedStream<S, F, C>
where
    S: RecordSource,
    F: Fn(&S::Item, &S::Item) -> Ordering,
    C: SpillFormat<S::Item>,
{
    fn drop(&mut self) {
        if let State::Closed = self.state {
            return;
        }
        if let Err(err) = self.close() {
            log::warn!("sorted stream not closed cleanly: {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::rc::Rc;

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, SortError};
    use crate::buffer::RunBufferBuilder;
    use crate::source::RecordSource;
    use crate::spill::{BoxError, SpillError, SpillFormat};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn files_under(path: &Path) -> usize {
        fs::read_dir(path)
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    1 + files_under(&entry.path())
                } else {
                    1
                }
            })
            .sum()
    }

    /// Source counting how many times it gets closed, failing after `fail_after` records.
    struct CountingSource {
        items: std::vec::IntoIter<i32>,
        fail_after: Option<usize>,
        read: usize,
        closed: Rc<Cell<usize>>,
    }

    impl CountingSource {
        fn new(items: Vec<i32>, fail_after: Option<usize>) -> (Self, Rc<Cell<usize>>) {
            let closed = Rc::new(Cell::new(0));
            let source = CountingSource {
                items: items.into_iter(),
                fail_after,
                read: 0,
                closed: Rc::clone(&closed),
            };
            (source, closed)
        }
    }

    impl RecordSource for CountingSource {
        type Item = i32;
        type Error = io::Error;

        fn next_record(&mut self) -> Result<Option<i32>, io::Error> {
            if self.fail_after == Some(self.read) {
                return Err(io::Error::new(io::ErrorKind::Other, "upstream failure"));
            }
            self.read += 1;
            Ok(self.items.next())
        }

        fn close(&mut self) -> Result<(), io::Error> {
            self.closed.set(self.closed.get() + 1);
            Ok(())
        }
    }

    fn shuffled(count: i32) -> Vec<Result<i32, io::Error>> {
        let mut input = Vec::from_iter(0..count);
        input.shuffle(&mut rand::thread_rng());
        Vec::from_iter(input.into_iter().map(|item| Ok(item)))
    }

    #[rstest]
    #[case(false, None)]
    #[case(true, None)]
    #[case(false, Some(2))]
    #[case(true, Some(2))]
    fn test_external_sorter(tmp_dir: tempfile::TempDir, #[case] reversed: bool, #[case] threads: Option<usize>) {
        let input_sorted = 0..100;

        let mut builder = ExternalSorterBuilder::new()
            .with_buffer(RunBufferBuilder::new(8, true))
            .with_tmp_dir(tmp_dir.path());
        if let Some(threads) = threads {
            builder = builder.with_threads_number(threads);
        }
        let sorter: ExternalSorter<i32, io::Error> = builder.build().unwrap();

        let compare = if reversed {
            |a: &i32, b: &i32| a.cmp(b).reverse()
        } else {
            |a: &i32, b: &i32| a.cmp(b)
        };

        let result = sorter.sort_iter_by(shuffled(100), compare).unwrap();
        assert_eq!(result.spilled_runs(), 12);

        let actual_result: Result<Vec<i32>, _> = result.collect();
        let actual_result = actual_result.unwrap();
        let expected_result = if reversed {
            Vec::from_iter(input_sorted.clone().rev())
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(actual_result, expected_result)
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_external_sorter_stability(tmp_dir: tempfile::TempDir, #[case] reversed: bool) {
        let input_sorted = (0..20).flat_map(|x| (0..5).map(move |y| (x, y)));

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());
        // sort input by the second field to check sorting stability
        input_shuffled.sort_by(|a: &(i32, i32), b: &(i32, i32)| {
            if reversed {
                a.1.cmp(&b.1).reverse()
            } else {
                a.1.cmp(&b.1)
            }
        });

        let input: Vec<Result<(i32, i32), io::Error>> = Vec::from_iter(input_shuffled.into_iter().map(|item| Ok(item)));

        let sorter: ExternalSorter<(i32, i32), _> = ExternalSorterBuilder::new()
            .with_buffer(RunBufferBuilder::new(8, true))
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let compare = if reversed {
            |a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0).reverse()
        } else {
            |a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0)
        };

        let result = sorter.sort_iter_by(input, compare).unwrap();

        let actual_result: Result<Vec<(i32, i32)>, _> = result.collect();
        let actual_result = actual_result.unwrap();
        let expected_result = if reversed {
            Vec::from_iter(input_sorted.clone().rev())
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(actual_result, expected_result)
    }

    #[rstest]
    fn test_mode_equivalence(tmp_dir: tempfile::TempDir) {
        let mut input = Vec::from_iter((0..200).map(|i| (i % 7, i)));
        input.shuffle(&mut rand::thread_rng());
        let compare = |a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0);

        let mut outputs = Vec::new();
        for page_size in [1000, 1] {
            let sorter: ExternalSorter<(i32, i32), io::Error> = ExternalSorterBuilder::new()
                .with_page_size(page_size)
                .with_tmp_dir(tmp_dir.path())
                .build()
                .unwrap();
            let stream = sorter.sort_iter_by(input.iter().cloned().map(Ok), compare).unwrap();
            assert_eq!(stream.is_in_memory(), page_size == 1000);

            let output: Result<Vec<_>, _> = stream.collect();
            outputs.push(output.unwrap());
        }

        assert_eq!(outputs[0].len(), 200);
        assert_eq!(outputs[0], outputs[1]);
    }

    #[rstest]
    fn test_in_memory_sort_creates_no_files(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(1000)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut stream = sorter.sort_iter(shuffled(500)).unwrap();
        assert!(stream.is_in_memory());
        assert_eq!(files_under(tmp_dir.path()), 0);

        assert_eq!(stream.next_record().unwrap(), Some(0));
        stream.close().unwrap();
    }

    #[rstest]
    fn test_full_page_is_spilled(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(10)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let stream = sorter.sort_iter(shuffled(10)).unwrap();
        assert_eq!(stream.spilled_runs(), 1);

        let actual: Result<Vec<i32>, _> = stream.collect();
        assert_eq!(actual.unwrap(), Vec::from_iter(0..10));
    }

    #[rstest]
    #[case(1)]
    #[case(1000)]
    fn test_empty_source(tmp_dir: tempfile::TempDir, #[case] page_size: usize) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(page_size)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut stream = sorter.sort_iter(Vec::new()).unwrap();
        assert!(stream.is_in_memory());
        assert_eq!(stream.has_next().unwrap(), false);
        assert_eq!(stream.next_record().unwrap(), None);
        stream.close().unwrap();
        assert_eq!(files_under(tmp_dir.path()), 0);
    }

    #[rstest]
    #[case(3, 0, None, Vec::from_iter(0..50))]
    #[case(3, 10, None, Vec::from_iter(10..50))]
    #[case(3, 10, Some(5), Vec::from_iter(10..15))]
    #[case(100, 45, Some(10), Vec::from_iter(45..50))]
    #[case(3, 60, None, vec![])]
    #[case(3, 0, Some(0), vec![])]
    fn test_offset_and_limit(
        tmp_dir: tempfile::TempDir,
        #[case] page_size: usize,
        #[case] offset: usize,
        #[case] limit: Option<usize>,
        #[case] expected: Vec<i32>,
    ) {
        let mut builder = ExternalSorterBuilder::new()
            .with_page_size(page_size)
            .with_offset(offset)
            .with_tmp_dir(tmp_dir.path());
        if let Some(limit) = limit {
            builder = builder.with_limit(limit);
        }
        let sorter: ExternalSorter<i32, io::Error> = builder.build().unwrap();

        let stream = sorter.sort_iter(shuffled(50)).unwrap();
        let actual: Result<Vec<i32>, _> = stream.collect();

        assert_eq!(actual.unwrap(), expected);
        assert_eq!(files_under(tmp_dir.path()), 0);
    }

    #[rstest]
    fn test_has_next(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut stream = sorter.sort_iter(vec![Ok(3), Ok(1), Ok(2)]).unwrap();
        assert!(stream.has_next().unwrap());
        assert!(stream.has_next().unwrap());
        assert_eq!(stream.next_record().unwrap(), Some(1));
        assert_eq!(stream.next_record().unwrap(), Some(2));
        assert!(stream.has_next().unwrap());
        assert_eq!(stream.next_record().unwrap(), Some(3));
        assert!(!stream.has_next().unwrap());
        assert_eq!(stream.next_record().unwrap(), None);
    }

    #[rstest]
    fn test_spill_files_removed_once_exhausted(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(4)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut stream = sorter.sort_iter(shuffled(40)).unwrap();
        assert_eq!(stream.spilled_runs(), 10);
        assert_eq!(files_under(tmp_dir.path()), 11);

        while stream.next_record().unwrap().is_some() {}
        assert_eq!(files_under(tmp_dir.path()), 0);

        stream.close().unwrap();
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_early_close_removes_spill_files(tmp_dir: tempfile::TempDir, #[case] explicit_close: bool) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(4)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let (source, closed) = CountingSource::new((0..40).rev().collect(), None);
        let mut stream = sorter.sort(source).unwrap();
        assert_eq!(stream.next_record().unwrap(), Some(0));
        assert_eq!(stream.next_record().unwrap(), Some(1));
        assert!(files_under(tmp_dir.path()) > 0);

        if explicit_close {
            stream.close().unwrap();
        } else {
            drop(stream);
        }

        assert_eq!(files_under(tmp_dir.path()), 0);
        assert_eq!(closed.get(), 1);
    }

    #[rstest]
    fn test_used_after_close(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(4)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let (source, closed) = CountingSource::new(vec![2, 1], None);
        let mut stream = sorter.sort(source).unwrap();
        stream.close().unwrap();

        assert!(matches!(stream.next_record(), Err(SortError::UsedAfterClose)));
        assert!(matches!(stream.has_next(), Err(SortError::UsedAfterClose)));
        assert!(matches!(stream.next(), Some(Err(SortError::UsedAfterClose))));
        assert!(matches!(stream.close(), Err(SortError::UsedAfterClose)));

        drop(stream);
        assert_eq!(closed.get(), 1);
    }

    #[rstest]
    fn test_input_error_cleans_up(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(4)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let (source, closed) = CountingSource::new((0..40).collect(), Some(21));
        match sorter.sort(source) {
            Err(SortError::InputError(err)) => assert_eq!(err.to_string(), "upstream failure"),
            Err(err) => panic!("input error expected, got {}", err),
            Ok(_) => panic!("input error expected"),
        }

        assert_eq!(files_under(tmp_dir.path()), 0);
        assert_eq!(closed.get(), 1);
    }

    /// Little-endian format refusing to encode sevens.
    struct NoSevensFormat;

    impl SpillFormat<i32> for NoSevensFormat {
        fn encode(item: &i32, buf: &mut Vec<u8>) -> Result<(), BoxError> {
            if *item == 7 {
                return Err("seven is not supported".into());
            }
            buf.extend_from_slice(&item.to_le_bytes());
            return Ok(());
        }

        fn decode(bytes: &[u8]) -> Result<i32, BoxError> {
            let bytes: [u8; 4] = bytes.try_into()?;
            return Ok(i32::from_le_bytes(bytes));
        }
    }

    #[rstest]
    fn test_spill_write_error_cleans_up(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32, io::Error, NoSevensFormat> = ExternalSorterBuilder::new()
            .with_page_size(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        // pages [0, 1], [2, 3] and [4, 5] are spilled before [6, 7] fails
        let (source, closed) = CountingSource::new((0..20).collect(), None);
        match sorter.sort(source) {
            Err(SortError::SpillWrite(SpillError::Encode(err))) => assert_eq!(err.to_string(), "seven is not supported"),
            Err(err) => panic!("spill write error expected, got {}", err),
            Ok(_) => panic!("spill write error expected"),
        }

        assert_eq!(files_under(tmp_dir.path()), 0);
        assert_eq!(closed.get(), 1);
    }

    #[rstest]
    fn test_corrupted_spill_file(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32, io::Error> = ExternalSorterBuilder::new()
            .with_page_size(4)
            .with_rw_buf_size(8)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut stream = sorter.sort_iter(shuffled(20)).unwrap();
        assert_eq!(stream.spilled_runs(), 5);

        // keep the headers only
        for dir in fs::read_dir(tmp_dir.path()).unwrap() {
            for spill in fs::read_dir(dir.unwrap().path()).unwrap() {
                let file = fs::OpenOptions::new().write(true).open(spill.unwrap().path()).unwrap();
                file.set_len(8).unwrap();
            }
        }

        let err = stream.next_record().unwrap_err();
        assert!(err.is_decode_error(), "decode error expected, got {}", err);
        assert_eq!(stream.next_record().unwrap(), None);
        assert_eq!(files_under(tmp_dir.path()), 0);

        stream.close().unwrap();
    }

    #[test]
    fn test_invalid_page_size() {
        let result: Result<ExternalSorter<i32, io::Error>, _> = ExternalSorterBuilder::new().with_page_size(0).build();
        assert!(matches!(result, Err(SortError::InvalidPageSize)));
    }
}
