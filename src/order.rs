//! Sort specifications and feature comparators.
//!
//! A sort specification is an ordered list of [`SortBy`] keys. Before any data is read the
//! specification is resolved against a [`Schema`] using an [`OrderingRegistry`]: every property
//! key is bound to its attribute position and to the ordering function of its declared type.
//! Comparing two features then never looks at types again.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::feature::{Feature, FieldType, Schema, Value};

/// Ordering of two attribute values of the same declared type.
pub type OrderingFn = fn(&Value, &Value) -> Ordering;

/// Boxed feature comparator accepted by [`ExternalSorter::sort_by`](crate::ExternalSorter::sort_by).
pub type FeatureOrdering = Box<dyn Fn(&Feature, &Feature) -> Ordering + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

/// Sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortBy {
    /// Order by feature identifier.
    Identifier(SortOrder),
    /// Order by attribute value.
    Property { name: String, order: SortOrder },
}

impl SortBy {
    /// Ascending identifier order.
    pub const NATURAL_ORDER: SortBy = SortBy::Identifier(SortOrder::Ascending);
    /// Descending identifier order.
    pub const REVERSE_ORDER: SortBy = SortBy::Identifier(SortOrder::Descending);

    pub fn ascending(name: &str) -> SortBy {
        SortBy::Property {
            name: name.to_string(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(name: &str) -> SortBy {
        SortBy::Property {
            name: name.to_string(),
            order: SortOrder::Descending,
        }
    }
}

impl Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortBy::Identifier(SortOrder::Ascending) => write!(f, "natural"),
            SortBy::Identifier(SortOrder::Descending) => write!(f, "reverse"),
            SortBy::Property { name, order: SortOrder::Ascending } => write!(f, "{}:asc", name),
            SortBy::Property { name, order: SortOrder::Descending } => write!(f, "{}:desc", name),
        }
    }
}

/// Parses `natural`, `reverse`, `<name>`, `<name>:asc` and `<name>:desc`.
impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, order) = match s.rsplit_once(':') {
            Some((name, "asc")) => (name, SortOrder::Ascending),
            Some((name, "desc")) => (name, SortOrder::Descending),
            Some((_, order)) => return Err(format!("unknown sort order '{}', asc or desc expected", order)),
            None => match s {
                "natural" => return Ok(SortBy::NATURAL_ORDER),
                "reverse" => return Ok(SortBy::REVERSE_ORDER),
                _ => (s, SortOrder::Ascending),
            },
        };

        if name.is_empty() {
            return Err(format!("sort key '{}' has no property name", s));
        }

        Ok(SortBy::Property {
            name: name.to_string(),
            order,
        })
    }
}

/// Reason a sort specification cannot be applied to a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfeasibleSort {
    /// The sort specification has no keys.
    NoKeys,
    /// A key names an attribute the schema does not have.
    UnknownProperty(String),
    /// A key names an attribute whose type has no registered ordering.
    Unorderable { name: String, field_type: FieldType },
}

impl Error for InfeasibleSort {}

impl Display for InfeasibleSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfeasibleSort::NoKeys => write!(f, "no sort keys given"),
            InfeasibleSort::UnknownProperty(name) => write!(f, "property '{}' not found in schema", name),
            InfeasibleSort::Unorderable { name, field_type } => {
                write!(f, "property '{}' of type {} has no ordering", name, field_type)
            }
        }
    }
}

/// Field type to ordering function mapping.
#[derive(Clone)]
pub struct OrderingRegistry {
    orderings: HashMap<FieldType, OrderingFn>,
}

impl OrderingRegistry {
    /// Creates a registry without any ordering.
    pub fn empty() -> Self {
        OrderingRegistry {
            orderings: HashMap::new(),
        }
    }

    /// Registers (or replaces) the ordering of a field type.
    pub fn register(mut self, field_type: FieldType, ordering: OrderingFn) -> OrderingRegistry {
        self.orderings.insert(field_type, ordering);
        return self;
    }

    pub fn lookup(&self, field_type: FieldType) -> Option<OrderingFn> {
        self.orderings.get(&field_type).copied()
    }
}

/// Orderings for every scalar type. Geometries are left out.
impl Default for OrderingRegistry {
    fn default() -> Self {
        OrderingRegistry::empty()
            .register(FieldType::Boolean, compare_booleans)
            .register(FieldType::Integer, compare_integers)
            .register(FieldType::Float, compare_floats)
            .register(FieldType::String, compare_strings)
            .register(FieldType::Timestamp, compare_timestamps)
    }
}

pub fn compare_booleans(a: &Value, b: &Value) -> Ordering {
    nulls_first(a, b, |a, b| match (a, b) {
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        _ => None,
    })
}

pub fn compare_integers(a: &Value, b: &Value) -> Ordering {
    nulls_first(a, b, |a, b| match (a, b) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        _ => None,
    })
}

/// Integers met in a float attribute are compared by their float value.
pub fn compare_floats(a: &Value, b: &Value) -> Ordering {
    fn as_float(value: &Value) -> Option<f64> {
        match value {
            Value::Float(value) => Some(*value),
            Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    nulls_first(a, b, |a, b| Some(as_float(a)?.total_cmp(&as_float(b)?)))
}

pub fn compare_strings(a: &Value, b: &Value) -> Ordering {
    nulls_first(a, b, |a, b| match (a, b) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    })
}

pub fn compare_timestamps(a: &Value, b: &Value) -> Ordering {
    nulls_first(a, b, |a, b| match (a, b) {
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        _ => None,
    })
}

/// Nulls sort before everything else. Values of mismatching types are ordered by variant.
fn nulls_first<F>(a: &Value, b: &Value, compare: F) -> Ordering
where
    F: Fn(&Value, &Value) -> Option<Ordering>,
{
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => compare(a, b).unwrap_or_else(|| variant_rank(a).cmp(&variant_rank(b))),
    }
}

fn variant_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Boolean(_) => 1,
        Value::Integer(_) => 2,
        Value::Float(_) => 3,
        Value::String(_) => 4,
        Value::Timestamp(_) => 5,
        Value::Geometry(_) => 6,
    }
}

enum ResolvedKey {
    Identifier(SortOrder),
    Property {
        index: usize,
        order: SortOrder,
        ordering: OrderingFn,
    },
}

fn resolve(schema: &Schema, sort_by: &[SortBy], registry: &OrderingRegistry) -> Result<Vec<ResolvedKey>, InfeasibleSort> {
    if sort_by.is_empty() {
        return Err(InfeasibleSort::NoKeys);
    }

    sort_by
        .iter()
        .map(|key| match key {
            SortBy::Identifier(order) => Ok(ResolvedKey::Identifier(*order)),
            SortBy::Property { name, order } => {
                let index = schema
                    .index_of(name)
                    .ok_or_else(|| InfeasibleSort::UnknownProperty(name.clone()))?;
                let field_type = schema.fields()[index].field_type;
                let ordering = registry.lookup(field_type).ok_or_else(|| InfeasibleSort::Unorderable {
                    name: name.clone(),
                    field_type,
                })?;

                Ok(ResolvedKey::Property {
                    index,
                    order: *order,
                    ordering,
                })
            }
        })
        .collect()
}

/// Checks whether features of `schema` can be sorted by `sort_by`: the list is not empty and
/// every property key names an attribute of the schema whose type has a registered ordering.
pub fn can_sort(schema: &Schema, sort_by: &[SortBy], registry: &OrderingRegistry) -> bool {
    resolve(schema, sort_by, registry).is_ok()
}

/// Comparator of features resolved from a sort specification.
///
/// Keys are applied in order, the first non-equal one decides. Features equal under every key
/// are ordered by identifier unless [`FeatureComparator::without_identifier_tie_break`] is used.
pub struct FeatureComparator {
    keys: Vec<ResolvedKey>,
    identifier_tie_break: bool,
}

impl FeatureComparator {
    pub fn new(schema: &Schema, sort_by: &[SortBy], registry: &OrderingRegistry) -> Result<Self, InfeasibleSort> {
        Ok(FeatureComparator {
            keys: resolve(schema, sort_by, registry)?,
            identifier_tie_break: true,
        })
    }

    /// Leaves features equal under every key unordered, so a stable sort keeps them in input order.
    pub fn without_identifier_tie_break(mut self) -> Self {
        self.identifier_tie_break = false;
        return self;
    }

    pub fn compare(&self, a: &Feature, b: &Feature) -> Ordering {
        for key in &self.keys {
            let ordering = match key {
                ResolvedKey::Identifier(order) => order.apply(a.id().cmp(b.id())),
                ResolvedKey::Property { index, order, ordering } => {
                    order.apply(ordering(a.value(*index), b.value(*index)))
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        if self.identifier_tie_break {
            a.id().cmp(b.id())
        } else {
            Ordering::Equal
        }
    }

    pub fn into_fn(self) -> FeatureOrdering {
        Box::new(move |a: &Feature, b: &Feature| self.compare(a, b))
    }
}
