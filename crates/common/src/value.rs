//! Row values with two comparison regimes: a total "storage order" used for
//! map keys and sort-key material, and SQL comparison semantics used when
//! evaluating filter predicates (`NULL` compares equal to nothing, including
//! itself; unknown collapses to false at the predicate boundary).

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    hash::{
        Hash,
        Hasher,
    },
};

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// A single column value, mirroring SQLite's storage classes.
#[derive(Clone, Debug)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Storage class rank, matching SQLite's cross-class ordering.
    fn class_rank(&self) -> u8 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Integer(_) | SqlValue::Real(_) => 1,
            SqlValue::Text(_) => 2,
            SqlValue::Blob(_) => 3,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// SQL comparison: `None` when either side is NULL or the classes are
    /// incomparable. Numeric classes compare across integer/real.
    pub fn sql_cmp(&self, other: &SqlValue) -> Option<Ordering> {
        use SqlValue::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Integer(a), Real(b)) => (*a as f64).partial_cmp(b),
            (Real(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Real(a), Real(b)) => a.partial_cmp(b),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Blob(a), Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// SQL equality: `None` when either side is NULL, `Some(false)` for
    /// incomparable classes.
    pub fn sql_eq(&self, other: &SqlValue) -> Option<bool> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.sql_cmp(other) == Some(Ordering::Equal))
    }

    /// Parse a JSON value from a change-log payload or wire frame. JSON
    /// booleans map to 0/1 (SQLite has no boolean storage class); arrays and
    /// objects are carried as their JSON text.
    pub fn from_json(value: JsonValue) -> SqlValue {
        match value {
            JsonValue::Null => SqlValue::Null,
            JsonValue::Bool(b) => SqlValue::Integer(b as i64),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Integer(i)
                } else {
                    SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))
                }
            },
            JsonValue::String(s) => SqlValue::Text(s),
            value @ (JsonValue::Array(_) | JsonValue::Object(_)) => {
                SqlValue::Text(value.to_string())
            },
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Integer(i) => JsonValue::from(*i),
            SqlValue::Real(r) => {
                serde_json::Number::from_f64(*r).map(JsonValue::Number).unwrap_or(JsonValue::Null)
            },
            SqlValue::Text(s) => JsonValue::String(s.clone()),
            SqlValue::Blob(b) => JsonValue::String(hex::encode(b)),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r}"),
            SqlValue::Text(s) => write!(f, "{s:?}"),
            SqlValue::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SqlValue {}

impl PartialOrd for SqlValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SqlValue {
    /// Total storage order: NULL < numerics < text < blob, numerics merged
    /// across integer/real (ties broken integer-first so the order stays
    /// antisymmetric), NaN above every number.
    fn cmp(&self, other: &Self) -> Ordering {
        use SqlValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Integer(a), Integer(b)) => a.cmp(b),
            (Real(a), Real(b)) => cmp_real(*a, *b),
            (Integer(a), Real(b)) => cmp_int_real(*a, *b),
            (Real(a), Integer(b)) => cmp_int_real(*b, *a).reverse(),
            (Text(a), Text(b)) => a.cmp(b),
            (Blob(a), Blob(b)) => a.cmp(b),
            (a, b) => a.class_rank().cmp(&b.class_rank()),
        }
    }
}

fn cmp_real(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn cmp_int_real(int: i64, real: f64) -> Ordering {
    if real.is_nan() {
        return Ordering::Less;
    }
    match (int as f64).partial_cmp(&real) {
        Some(Ordering::Equal) | None => Ordering::Less,
        Some(ordering) => ordering,
    }
}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            SqlValue::Null => 0u8.hash(state),
            SqlValue::Integer(i) => {
                1u8.hash(state);
                i.hash(state);
            },
            SqlValue::Real(r) => {
                2u8.hash(state);
                // Normalize so Hash stays consistent with Eq: all NaNs are
                // equal, and -0.0 == 0.0.
                let bits = if r.is_nan() {
                    f64::NAN.to_bits()
                } else if *r == 0.0 {
                    0f64.to_bits()
                } else {
                    r.to_bits()
                };
                bits.hash(state);
            },
            SqlValue::Text(s) => {
                3u8.hash(state);
                s.hash(state);
            },
            SqlValue::Blob(b) => {
                4u8.hash(state);
                b.hash(state);
            },
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Ok(SqlValue::from_json(json))
    }
}

/// One row's columns, keyed by column name.
pub type RowData = BTreeMap<String, SqlValue>;

/// Identifies one row of one table by primary key. The ordering is the
/// storage order, so these can key BTreeMaps in CVRs and pipelines.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub table: String,
    pub pk: Vec<SqlValue>,
}

impl RowKey {
    pub fn new(table: impl Into<String>, pk: Vec<SqlValue>) -> Self {
        Self {
            table: table.into(),
            pk,
        }
    }

    /// Canonical JSON text of the primary key, used as a SQL column value in
    /// the CVR store and the replica change log.
    pub fn pk_json(&self) -> String {
        JsonValue::Array(self.pk.iter().map(|v| v.to_json()).collect()).to_string()
    }

    pub fn pk_from_json(table: &str, json: &str) -> anyhow::Result<Self> {
        let values: Vec<JsonValue> = serde_json::from_str(json)?;
        Ok(Self {
            table: table.to_owned(),
            pk: values.into_iter().map(SqlValue::from_json).collect(),
        })
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.table, self.pk_json())
    }
}
