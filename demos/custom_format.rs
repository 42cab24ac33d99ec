use std::fs;
use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;

use feature_sort::spill::BoxError;
use feature_sort::{ExternalSorter, ExternalSorterBuilder, SpillFormat};

/// Spills numbers as raw little-endian words instead of MessagePack.
struct RawU32Format;

impl SpillFormat<u32> for RawU32Format {
    fn encode(item: &u32, buf: &mut Vec<u8>) -> Result<(), BoxError> {
        buf.extend_from_slice(&item.to_le_bytes());
        return Ok(());
    }

    fn decode(bytes: &[u8]) -> Result<u32, BoxError> {
        let word: [u8; 4] = bytes.try_into()?;
        return Ok(u32::from_le_bytes(word));
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input_reader = io::BufReader::new(fs::File::open("input.txt").unwrap());
    let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());

    let sorter: ExternalSorter<u32, io::Error, RawU32Format> = ExternalSorterBuilder::new()
        .with_tmp_dir(path::Path::new("./"))
        .with_page_size(1_000_000)
        .with_threads_number(4)
        .build()
        .unwrap();

    let sorted = sorter
        .sort_iter(input_reader.lines().map(|line| {
            let line = line.unwrap();
            let number = line.parse().unwrap();

            return Ok(number);
        }))
        .unwrap();

    for item in sorted.map(Result::unwrap) {
        output_writer.write_all(format!("{}\n", item).as_bytes()).unwrap();
    }
    output_writer.flush().unwrap();
}
