//! Tab-separated feature files.
//!
//! The first line is the header: the `id` column followed by one `name:type` column per attribute,
//! `type` being one of `boolean`, `integer`, `float`, `string`, `timestamp` (milliseconds since the
//! epoch) or `geometry`. Every following line holds one feature. An empty cell is a null value.
//! Geometries are written as `POINT(x y)`, `LINESTRING(x y, x y)` or `POLYGON((x y, x y), (x y, x y))`.
//! Cells holding tabs, quotes or line breaks are double-quoted.

use std::error::Error;
use std::fmt::{self, Display, Write as _};
use std::io;

use crate::feature::{Coordinate, Feature, FeatureReader, FieldType, Geometry, Schema, Value};
use crate::source::RecordSource;

const DELIMITER: u8 = b'\t';
const ID_COLUMN: &str = "id";

/// Feature file reading or writing error.
#[derive(Debug)]
pub enum TextError {
    IO(io::Error),
    /// Malformed content at a 1-based line number.
    Parse { line: usize, message: String },
}

impl Error for TextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            TextError::IO(err) => Some(err),
            TextError::Parse { .. } => None,
        }
    }
}

impl Display for TextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            TextError::IO(err) => write!(f, "feature file I/O error: {}", err),
            TextError::Parse { line, message } => write!(f, "line {}: {}", line, message),
        }
    }
}

impl From<io::Error> for TextError {
    fn from(err: io::Error) -> Self {
        TextError::IO(err)
    }
}

impl From<csv::Error> for TextError {
    fn from(err: csv::Error) -> Self {
        let line = err.position().map_or(0, |pos| pos.line() as usize);
        let message = err.to_string();

        match err.into_kind() {
            csv::ErrorKind::Io(err) => TextError::IO(err),
            _ => TextError::Parse { line, message },
        }
    }
}

/// Reads features from a tab-separated file.
pub struct DelimitedFeatureReader<R> {
    schema: Schema,
    reader: Option<csv::Reader<R>>,
    record: csv::StringRecord,
}

impl<R: io::Read> DelimitedFeatureReader<R> {
    /// Reads the header line and returns a reader positioned on the first feature.
    pub fn new(schema_name: &str, input: R) -> Result<Self, TextError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(DELIMITER)
            .has_headers(true)
            .flexible(false)
            .from_reader(input);

        let schema =
            parse_header(schema_name, reader.headers()?).map_err(|message| TextError::Parse { line: 1, message })?;
        log::debug!("feature file header read: {} attributes", schema.fields().len());

        return Ok(DelimitedFeatureReader {
            schema,
            reader: Some(reader),
            record: csv::StringRecord::new(),
        });
    }
}

impl<R: io::Read> RecordSource for DelimitedFeatureReader<R> {
    type Item = Feature;
    type Error = TextError;

    fn next_record(&mut self) -> Result<Option<Feature>, TextError> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };
        if !reader.read_record(&mut self.record)? {
            return Ok(None);
        }

        parse_feature(&self.schema, &self.record).map(Some).map_err(|message| TextError::Parse {
            line: self.record.position().map_or(0, |pos| pos.line() as usize),
            message,
        })
    }

    fn close(&mut self) -> Result<(), TextError> {
        self.reader = None;
        Ok(())
    }
}

impl<R: io::Read> FeatureReader for DelimitedFeatureReader<R> {
    fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// Writes features to a tab-separated file.
pub struct DelimitedFeatureWriter<W: io::Write> {
    writer: csv::Writer<W>,
    attributes: usize,
    cells: Vec<String>,
}

impl<W: io::Write> DelimitedFeatureWriter<W> {
    /// Writes the header line of `schema`.
    pub fn new(writer: W, schema: &Schema) -> Result<Self, TextError> {
        let mut writer = csv::WriterBuilder::new().delimiter(DELIMITER).from_writer(writer);

        let mut header = vec![ID_COLUMN.to_string()];
        header.extend(
            schema
                .fields()
                .iter()
                .map(|field| format!("{}:{}", field.name, field.field_type)),
        );
        writer.write_record(&header)?;

        return Ok(DelimitedFeatureWriter {
            writer,
            attributes: schema.fields().len(),
            cells: Vec::new(),
        });
    }

    /// Writes one feature, missing trailing values as nulls.
    pub fn write(&mut self, feature: &Feature) -> Result<(), TextError> {
        self.cells.clear();
        self.cells.push(feature.id().to_string());
        for idx in 0..self.attributes {
            let mut cell = String::new();
            format_value(&mut cell, feature.value(idx)).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            self.cells.push(cell);
        }

        self.writer.write_record(&self.cells)?;
        return Ok(());
    }

    pub fn flush(&mut self) -> Result<(), TextError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes the buffered features and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, TextError> {
        self.writer
            .into_inner()
            .map_err(|err| TextError::IO(io::Error::new(err.error().kind(), err.error().to_string())))
    }
}

fn parse_header(schema_name: &str, header: &csv::StringRecord) -> Result<Schema, String> {
    let mut columns = header.iter();
    if columns.next() != Some(ID_COLUMN) {
        return Err(format!("first column must be {}", ID_COLUMN));
    }

    let mut builder = Schema::builder(schema_name);
    for column in columns {
        let (name, type_name) = column
            .rsplit_once(':')
            .ok_or_else(|| format!("column {} has no type", column))?;
        let field_type =
            FieldType::from_name(type_name).ok_or_else(|| format!("column {} has unknown type {}", name, type_name))?;
        builder = builder.field(name, field_type);
    }

    return Ok(builder.build());
}

fn parse_feature(schema: &Schema, record: &csv::StringRecord) -> Result<Feature, String> {
    let mut cells = record.iter();
    let id = cells.next().filter(|id| !id.is_empty()).ok_or("feature identifier missing")?;

    let mut values = Vec::with_capacity(schema.fields().len());
    for (field, cell) in schema.fields().iter().zip(cells) {
        let value =
            parse_value(field.field_type, cell).map_err(|err| format!("attribute {} not parsed: {}", field.name, err))?;
        debug_assert!(value.field_type().map_or(true, |field_type| field_type == field.field_type));
        values.push(value);
    }

    return Ok(Feature::new(id, values));
}

fn parse_value(field_type: FieldType, cell: &str) -> Result<Value, String> {
    if cell.is_empty() {
        return Ok(Value::Null);
    }

    let value = match field_type {
        FieldType::Boolean => match cell {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            _ => return Err(format!("{} is not a boolean", cell)),
        },
        FieldType::Integer => Value::Integer(cell.parse().map_err(|err| format!("{}: {}", cell, err))?),
        FieldType::Float => Value::Float(cell.parse().map_err(|err| format!("{}: {}", cell, err))?),
        FieldType::String => Value::String(cell.to_string()),
        FieldType::Timestamp => Value::Timestamp(cell.parse().map_err(|err| format!("{}: {}", cell, err))?),
        FieldType::Geometry => Value::Geometry(parse_geometry(cell)?),
    };

    return Ok(value);
}

fn parse_geometry(cell: &str) -> Result<Geometry, String> {
    let (kind, body) = cell
        .split_once('(')
        .ok_or_else(|| format!("{} is not a geometry", cell))?;
    let body = body
        .strip_suffix(')')
        .ok_or_else(|| format!("{} is not a geometry", cell))?;

    match kind.trim() {
        "POINT" => Ok(Geometry::Point(parse_coordinate(body)?)),
        "LINESTRING" => Ok(Geometry::LineString(parse_coordinates(body)?)),
        "POLYGON" => {
            let rings = body
                .split("),")
                .map(|ring| {
                    let ring = ring.trim().trim_start_matches('(').trim_end_matches(')');
                    parse_coordinates(ring)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Geometry::Polygon(rings))
        }
        kind => Err(format!("unsupported geometry type {}", kind)),
    }
}

fn parse_coordinates(text: &str) -> Result<Vec<Coordinate>, String> {
    text.split(',').map(parse_coordinate).collect()
}

fn parse_coordinate(text: &str) -> Result<Coordinate, String> {
    let mut ordinates = text.split_whitespace().map(|ordinate| {
        ordinate
            .parse::<f64>()
            .map_err(|err| format!("ordinate {}: {}", ordinate, err))
    });

    match (ordinates.next(), ordinates.next(), ordinates.next()) {
        (Some(x), Some(y), None) => Ok(Coordinate::new(x?, y?)),
        _ => Err(format!("{} is not a coordinate", text.trim())),
    }
}

fn format_value(out: &mut String, value: &Value) -> fmt::Result {
    match value {
        Value::Null => Ok(()),
        Value::Boolean(value) => write!(out, "{}", value),
        Value::Integer(value) | Value::Timestamp(value) => write!(out, "{}", value),
        Value::Float(value) => write!(out, "{}", value),
        Value::String(value) => {
            out.push_str(value);
            Ok(())
        }
        Value::Geometry(geometry) => format_geometry(out, geometry),
    }
}

fn format_geometry(out: &mut String, geometry: &Geometry) -> fmt::Result {
    match geometry {
        Geometry::Point(coordinate) => write!(out, "POINT({} {})", coordinate.x, coordinate.y),
        Geometry::LineString(coordinates) => {
            out.push_str("LINESTRING(");
            format_coordinates(out, coordinates)?;
            out.push(')');
            Ok(())
        }
        Geometry::Polygon(rings) => {
            out.push_str("POLYGON(");
            for (idx, ring) in rings.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                out.push('(');
                format_coordinates(out, ring)?;
                out.push(')');
            }
            out.push(')');
            Ok(())
        }
    }
}

fn format_coordinates(out: &mut String, coordinates: &[Coordinate]) -> fmt::Result {
    for (idx, coordinate) in coordinates.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        write!(out, "{} {}", coordinate.x, coordinate.y)?;
    }
    Ok(())
}
