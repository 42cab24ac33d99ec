//! Feature model: schemas, typed attribute values and features.

use std::convert::Infallible;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::source::RecordSource;

/// Attribute type declared by a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    String,
    /// Milliseconds since the Unix epoch.
    Timestamp,
    Geometry,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Timestamp => "timestamp",
            FieldType::Geometry => "geometry",
        }
    }

    pub fn from_name(name: &str) -> Option<FieldType> {
        match name {
            "boolean" => Some(FieldType::Boolean),
            "integer" => Some(FieldType::Integer),
            "float" => Some(FieldType::Float),
            "string" => Some(FieldType::String),
            "timestamp" => Some(FieldType::Timestamp),
            "geometry" => Some(FieldType::Geometry),
            _ => None,
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

impl Coordinate {
    pub fn new(x: f64, y: f64) -> Self {
        Coordinate { x, y }
    }
}

/// Geometry attribute value. Geometries carry no ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Coordinate),
    LineString(Vec<Coordinate>),
    Polygon(Vec<Vec<Coordinate>>),
}

/// Attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Timestamp(i64),
    Geometry(Geometry),
}

impl Value {
    /// Type of a non-null value.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(FieldType::Boolean),
            Value::Integer(_) => Some(FieldType::Integer),
            Value::Float(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::String),
            Value::Timestamp(_) => Some(FieldType::Timestamp),
            Value::Geometry(_) => Some(FieldType::Geometry),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Named, typed attribute of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
}

/// Feature type: an ordered list of attribute descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    fields: Vec<FieldDescriptor>,
}

impl Schema {
    pub fn builder(name: &str) -> SchemaBuilder {
        SchemaBuilder {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Position of the named attribute.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }
}

pub struct SchemaBuilder {
    name: String,
    fields: Vec<FieldDescriptor>,
}

impl SchemaBuilder {
    pub fn field(mut self, name: &str, field_type: FieldType) -> SchemaBuilder {
        self.fields.push(FieldDescriptor {
            name: name.to_string(),
            field_type,
        });
        return self;
    }

    pub fn build(self) -> Schema {
        Schema {
            name: self.name,
            fields: self.fields,
        }
    }
}

static NULL: Value = Value::Null;

/// A feature: identifier plus attribute values laid out as in its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    id: String,
    values: Vec<Value>,
}

impl Feature {
    pub fn new(id: impl Into<String>, values: Vec<Value>) -> Self {
        Feature { id: id.into(), values }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at the schema position `idx`; missing trailing values read as null.
    pub fn value(&self, idx: usize) -> &Value {
        self.values.get(idx).unwrap_or(&NULL)
    }

    /// Value of the named attribute.
    pub fn attribute(&self, schema: &Schema, name: &str) -> Option<&Value> {
        schema.index_of(name).map(|idx| self.value(idx))
    }
}

/// Record source of features sharing a schema.
pub trait FeatureReader: RecordSource<Item = Feature> {
    fn schema(&self) -> &Schema;
}

/// Feature reader over features held in memory.
pub struct MemoryFeatureReader {
    schema: Schema,
    features: std::vec::IntoIter<Feature>,
}

impl MemoryFeatureReader {
    pub fn new(schema: Schema, features: Vec<Feature>) -> Self {
        MemoryFeatureReader {
            schema,
            features: features.into_iter(),
        }
    }
}

impl RecordSource for MemoryFeatureReader {
    type Item = Feature;
    type Error = Infallible;

    fn next_record(&mut self) -> Result<Option<Feature>, Infallible> {
        Ok(self.features.next())
    }

    fn close(&mut self) -> Result<(), Infallible> {
        self.features = Vec::new().into_iter();
        Ok(())
    }
}

impl FeatureReader for MemoryFeatureReader {
    fn schema(&self) -> &Schema {
        &self.schema
    }
}
