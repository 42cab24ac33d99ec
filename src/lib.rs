//! `feature-sort` is a bounded-memory external merge sort for feature streams.
//!
//! Features are read from a source one at a time and collected into pages of at most `page_size`
//! records. A page that fills up is sorted and spilled to a temporary file; the last page stays in
//! memory. If nothing was spilled the last page is the result, otherwise every spilled run and the
//! last page are merged lazily while the caller pulls records. Memory use is bounded by the page
//! size plus one record per spilled run. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `feature-sort` supports the following features:
//!
//! * **Record agnostic engine:**
//!   [`ExternalSorter`] sorts any record implementing `serde` serialization/deserialization given a
//!   compare function; the spill format can be replaced through [`SpillFormat`].
//! * **Sort-by specifications:**
//!   multi-key property and identifier ordering of [`Feature`]s resolved against a [`Schema`] with
//!   an explicit [`OrderingRegistry`]; [`can_sort`] tells upfront whether a specification applies.
//! * **Offset and limit:**
//!   leading sorted records can be skipped and the output capped.
//! * **Scoped cleanup:**
//!   spill files live in a per-stream temporary directory that is removed once the stream is
//!   exhausted, closed or dropped.
//! * **Multithreading support:**
//!   pages can be sorted in a dedicated thread pool.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io;
//!
//! use feature_sort::{DelimitedFeatureReader, RecordSource, SortBy, SortedFeatureReader};
//!
//! fn main() {
//!     let input = io::BufReader::new(fs::File::open("roads.tsv").unwrap());
//!     let reader = DelimitedFeatureReader::new("roads", input).unwrap();
//!
//!     let sort_by = [SortBy::descending("lanes"), SortBy::NATURAL_ORDER];
//!     let mut sorted = SortedFeatureReader::new(reader, &sort_by, 10_000).unwrap();
//!
//!     while let Some(feature) = sorted.next_record().unwrap() {
//!         println!("{}", feature.id());
//!     }
//!     sorted.close().unwrap();
//! }
//! ```

pub mod buffer;
pub mod feature;
pub mod merger;
pub mod order;
pub mod reader;
pub mod sort;
pub mod source;
pub mod spill;
pub mod text;

pub use buffer::{RunBuffer, RunBufferBuilder, DEFAULT_PAGE_SIZE};
pub use feature::{Feature, FeatureReader, FieldType, Geometry, MemoryFeatureReader, Schema, Value};
pub use merger::BinaryHeapMerger;
pub use order::{can_sort, FeatureComparator, InfeasibleSort, OrderingRegistry, SortBy, SortOrder};
pub use reader::SortedFeatureReader;
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortedStream};
pub use source::{IterSource, RecordSource};
pub use spill::{RmpFormat, SpillError, SpillFormat};
pub use text::{DelimitedFeatureReader, DelimitedFeatureWriter, TextError};
