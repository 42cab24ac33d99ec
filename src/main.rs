use std::fs;
use std::io;
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use feature_sort::{
    DelimitedFeatureReader, DelimitedFeatureWriter, ExternalSorter, ExternalSorterBuilder, Feature, FeatureReader,
    OrderingRegistry, RecordSource, SortBy, SortedFeatureReader, TextError,
};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let sort_by: Vec<SortBy> = arg_parser.values_of_t_or_exit("sort");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let page_size: usize = arg_parser.value_of_t_or_exit("page_size");
    let offset: usize = arg_parser.value_of_t_or_exit("offset");
    let limit: Option<usize> = arg_parser
        .is_present("limit")
        .then(|| arg_parser.value_of_t_or_exit("limit"));
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let rw_buf_size: Option<ByteSize> = arg_parser
        .is_present("rw_buf_size")
        .then(|| arg_parser.value_of_t_or_exit("rw_buf_size"));

    let input = arg_parser.value_of("input").expect("value is required");
    let input_stream = match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let schema_name = path::Path::new(input)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "features".to_string());
    let feature_reader = match DelimitedFeatureReader::new(&schema_name, input_stream) {
        Ok(feature_reader) => feature_reader,
        Err(err) => {
            log::error!("input file reading error: {}", err);
            process::exit(1);
        }
    };

    let mut sorter_builder = ExternalSorterBuilder::new().with_page_size(page_size).with_offset(offset);
    if let Some(limit) = limit {
        sorter_builder = sorter_builder.with_limit(limit);
    }

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(rw_buf_size) = rw_buf_size {
        sorter_builder = sorter_builder.with_rw_buf_size(rw_buf_size.as_u64() as usize);
    }

    let sorter: ExternalSorter<Feature, TextError> = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    log::info!(
        "sorting {} by {}",
        input,
        sort_by.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    );
    let mut sorted_reader =
        match SortedFeatureReader::with_sorter(&sorter, feature_reader, &sort_by, &OrderingRegistry::default()) {
            Ok(sorted_reader) => sorted_reader,
            Err(err) => {
                log::error!("data sorting error: {}", err);
                process::exit(1);
            }
        };
    log::info!("{} runs spilled to disk", sorted_reader.spilled_runs());

    let output = arg_parser.value_of("output").expect("value is required");
    let output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };
    let mut feature_writer = match DelimitedFeatureWriter::new(output_stream, sorted_reader.schema()) {
        Ok(feature_writer) => feature_writer,
        Err(err) => {
            log::error!("data saving error: {}", err);
            process::exit(1);
        }
    };

    let mut written = 0;
    loop {
        let feature = match sorted_reader.next_record() {
            Ok(Some(feature)) => feature,
            Ok(None) => break,
            Err(err) => {
                log::error!("sorting stream error: {}", err);
                process::exit(1);
            }
        };
        if let Err(err) = feature_writer.write(&feature) {
            log::error!("data saving error: {}", err);
            process::exit(1);
        };
        written += 1;
    }

    if let Err(err) = sorted_reader.close() {
        log::error!("sorting stream closing error: {}", err);
        process::exit(1);
    }

    if let Err(err) = feature_writer.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }

    log::info!("{} features written to {}", written, output);
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("feature-sort")
        .about("external feature sorter")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("tab-separated feature file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sort key: property[:asc|desc], natural or reverse; may be repeated")
                .takes_value(true)
                .multiple_occurrences(true)
                .default_value("natural")
                .validator(|v| v.parse::<SortBy>().map(|_| ())),
        )
        .arg(
            clap::Arg::new("page_size")
                .short('p')
                .long("page-size")
                .help("number of features sorted in memory before spilling to disk")
                .takes_value(true)
                .default_value("1000")
                .validator(|v| match v.parse::<usize>() {
                    Ok(0) => Err("Page size must be positive".to_string()),
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Page size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("offset")
                .long("offset")
                .help("number of leading sorted features to skip")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            clap::Arg::new("limit")
                .long("limit")
                .help("maximum number of features to write")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("rw_buf_size")
                .long("rw-buf-size")
                .help("spill file read/write buffer size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Buffer size format incorrect: {}", err)),
                }),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
