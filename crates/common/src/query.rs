//! The canonical query AST.
//!
//! A query names a table, an optional filter condition, an ordered tuple of
//! sort keys, an optional limit, and related sub-queries joined by a
//! correlation of parent columns to child columns. Two ASTs are equal iff
//! their canonical serializations are byte-equal; the hash of that
//! serialization after transformation and permission rewrite is the
//! transformation hash, which keys pipelines.

use std::fmt::Write as _;

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    sha256::sha256_hex,
    types::{
        QueryHash,
        TransformationHash,
    },
    value::SqlValue,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ast {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "where")]
    pub where_clause: Option<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedQuery>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Simple { left: Operand, op: CmpOp, right: Operand },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operand {
    Column { name: String },
    Literal { value: SqlValue },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPart {
    pub column: String,
    pub dir: Direction,
}

/// Correlates parent rows to child rows: the i-th parent field pairs with
/// the i-th child field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    pub parent_fields: Vec<String>,
    pub child_fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedQuery {
    pub correlation: Correlation,
    pub alias: String,
    pub sub_query: Ast,
}

impl Ast {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
            order_by: vec![],
            limit: None,
            related: vec![],
        }
    }

    /// Canonical serialization. Struct field order is fixed and the tree
    /// contains no maps, so equal ASTs always produce identical bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("AST serialization is infallible")
    }

    pub fn query_hash(&self) -> QueryHash {
        QueryHash::from(sha256_hex(&self.canonical_bytes()))
    }

    pub fn transformation_hash(&self) -> TransformationHash {
        TransformationHash::from(sha256_hex(&self.canonical_bytes()))
    }

    /// Every table this query (including related sub-queries) reads from.
    pub fn touched_tables(&self) -> Vec<&str> {
        let mut tables = vec![self.table.as_str()];
        for related in &self.related {
            tables.extend(related.sub_query.touched_tables());
        }
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    /// Conjoin an additional condition with the existing filter.
    pub fn and_where(&mut self, condition: Condition) {
        self.where_clause = Some(match self.where_clause.take() {
            None => condition,
            Some(Condition::And { mut conditions }) => {
                conditions.push(condition);
                Condition::And { conditions }
            },
            Some(existing) => Condition::And {
                conditions: vec![existing, condition],
            },
        });
    }

    /// Stable builder-style text form, the serialization reported by the
    /// inspector for permission-rewritten ASTs.
    pub fn to_builder_string(&self) -> String {
        let mut out = self.table.clone();
        if let Some(condition) = &self.where_clause {
            render_top_level(&mut out, condition);
        }
        for part in &self.order_by {
            let _ = write!(
                out,
                ".orderBy({}, {})",
                json_str(&part.column),
                json_str(part.dir.as_str())
            );
        }
        if let Some(limit) = self.limit {
            let _ = write!(out, ".limit({limit})");
        }
        for related in &self.related {
            let _ = write!(
                out,
                ".related({}, {})",
                json_str(&related.alias),
                related.sub_query.to_builder_string()
            );
        }
        out
    }
}

/// Top-level AND conjuncts render as chained `.where(..)` calls; nested
/// composites render as `and(..)` / `or(..)` over `cmp(..)` triples.
fn render_top_level(out: &mut String, condition: &Condition) {
    match condition {
        Condition::And { conditions } => {
            for condition in conditions {
                render_top_level(out, condition);
            }
        },
        Condition::Simple { left, op, right } => {
            render_where(out, left, *op, right);
        },
        Condition::Or { .. } => {
            out.push_str(".where(");
            render_nested(out, condition);
            out.push(')');
        },
    }
}

fn render_where(out: &mut String, left: &Operand, op: CmpOp, right: &Operand) {
    match op {
        CmpOp::Eq => {
            let _ = write!(out, ".where({}, {})", render_operand(left), render_operand(right));
        },
        _ => {
            let _ = write!(
                out,
                ".where({}, {}, {})",
                render_operand(left),
                json_str(op.as_str()),
                render_operand(right)
            );
        },
    }
}

fn render_nested(out: &mut String, condition: &Condition) {
    match condition {
        Condition::And { conditions } => {
            out.push_str("and(");
            render_list(out, conditions);
            out.push(')');
        },
        Condition::Or { conditions } => {
            out.push_str("or(");
            render_list(out, conditions);
            out.push(')');
        },
        Condition::Simple { left, op, right } => {
            let _ = write!(
                out,
                "cmp({}, {}, {})",
                render_operand(left),
                json_str(op.as_str()),
                render_operand(right)
            );
        },
    }
}

fn render_list(out: &mut String, conditions: &[Condition]) {
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        render_nested(out, condition);
    }
}

fn render_operand(operand: &Operand) -> String {
    match operand {
        Operand::Column { name } => json_str(name),
        Operand::Literal { value } => value.to_json().to_string(),
    }
}

fn json_str(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

/// Convenience constructors used throughout the pipeline and tests.
pub fn column(name: impl Into<String>) -> Operand {
    Operand::Column { name: name.into() }
}

pub fn literal(value: SqlValue) -> Operand {
    Operand::Literal { value }
}

pub fn cmp(left: Operand, op: CmpOp, right: Operand) -> Condition {
    Condition::Simple {
        left,
        op,
        right,
    }
}
