use std::fs;
use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;

use feature_sort::{
    DelimitedFeatureReader, DelimitedFeatureWriter, ExternalSorter, ExternalSorterBuilder, Feature, FeatureReader,
    OrderingRegistry, RecordSource, SortBy, SortedFeatureReader, TextError,
};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input_reader = io::BufReader::new(fs::File::open("roads.tsv").unwrap());
    let output_writer = io::BufWriter::new(fs::File::create("roads.sorted.tsv").unwrap());

    let roads = DelimitedFeatureReader::new("roads", input_reader).unwrap();

    let sorter: ExternalSorter<Feature, TextError> = ExternalSorterBuilder::new()
        .with_tmp_dir(path::Path::new("./"))
        .with_page_size(10_000)
        .with_offset(10)
        .build()
        .unwrap();

    // widest roads first, equal widths by identifier
    let sort_by = [SortBy::descending("lanes"), SortBy::NATURAL_ORDER];
    let mut sorted = SortedFeatureReader::with_sorter(&sorter, roads, &sort_by, &OrderingRegistry::default()).unwrap();

    let mut feature_writer = DelimitedFeatureWriter::new(output_writer, sorted.schema()).unwrap();
    while let Some(feature) = sorted.next_record().unwrap() {
        feature_writer.write(&feature).unwrap();
    }
    sorted.close().unwrap();

    feature_writer.into_inner().unwrap().flush().unwrap();
}
