//! SQL generation for hydration and window recomputation. Everything here
//! produces positional-parameter statements run against a snapshot.

use common::{
    query::{
        CmpOp,
        Condition,
        Direction,
        Operand,
        OrderPart,
    },
    value::SqlValue,
};

fn push_operand(operand: &Operand, sql: &mut String, params: &mut Vec<SqlValue>) {
    match operand {
        Operand::Column { name } => {
            sql.push('"');
            sql.push_str(name);
            sql.push('"');
        },
        Operand::Literal { value } => {
            params.push(value.clone());
            sql.push('?');
        },
    }
}

fn push_condition(condition: &Condition, sql: &mut String, params: &mut Vec<SqlValue>) {
    match condition {
        Condition::And { conditions } | Condition::Or { conditions } if conditions.is_empty() => {
            // Empty conjunction is vacuously true; empty disjunction false.
            let vacuous = matches!(condition, Condition::And { .. });
            sql.push_str(if vacuous { "1 = 1" } else { "1 = 0" });
        },
        Condition::And { conditions } => {
            sql.push('(');
            for (i, c) in conditions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" AND ");
                }
                push_condition(c, sql, params);
            }
            sql.push(')');
        },
        Condition::Or { conditions } => {
            sql.push('(');
            for (i, c) in conditions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" OR ");
                }
                push_condition(c, sql, params);
            }
            sql.push(')');
        },
        Condition::Simple { left, op, right } => {
            sql.push('(');
            push_operand(left, sql, params);
            let op_sql = match op {
                CmpOp::Eq => " = ",
                CmpOp::Ne => " != ",
                CmpOp::Lt => " < ",
                CmpOp::Le => " <= ",
                CmpOp::Gt => " > ",
                CmpOp::Ge => " >= ",
            };
            sql.push_str(op_sql);
            push_operand(right, sql, params);
            sql.push(')');
        },
    }
}

/// Build the SELECT materializing one window of a node: its filter, an
/// optional correlation equality per column, the node's sort order with the
/// primary key as tiebreak, and the limit.
pub fn build_select(
    table: &str,
    where_clause: Option<&Condition>,
    correlation_eq: &[(String, SqlValue)],
    order_by: &[OrderPart],
    pk_cols: &[String],
    limit: Option<u64>,
) -> (String, Vec<SqlValue>) {
    let mut sql = format!("SELECT * FROM \"{table}\"");
    let mut params = Vec::new();

    let mut predicates = Vec::new();
    if let Some(condition) = where_clause {
        let mut fragment = String::new();
        push_condition(condition, &mut fragment, &mut params);
        predicates.push(fragment);
    }
    for (column, value) in correlation_eq {
        // Correlations with a NULL parent value match nothing, per SQL
        // comparison semantics.
        params.push(value.clone());
        predicates.push(format!("(\"{column}\" = ?)"));
    }
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    let mut order_terms: Vec<String> = order_by
        .iter()
        .map(|part| {
            let dir = match part.dir {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            format!("\"{}\" {dir}", part.column)
        })
        .collect();
    for pk in pk_cols {
        if !order_by.iter().any(|p| &p.column == pk) {
            order_terms.push(format!("\"{pk}\" ASC"));
        }
    }
    if !order_terms.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_terms.join(", "));
    }

    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    (sql, params)
}

/// The SELECT statements hydration would run for a query, root first, each
/// related sub-query following its parent with its correlation bound to a
/// placeholder. Reported by the inspector as the query's join plan.
pub fn hydration_plan(
    ast: &common::query::Ast,
    snapshot: &replica::Snapshot,
) -> anyhow::Result<Vec<String>> {
    let mut plans = Vec::new();
    collect_plan(ast, None, snapshot, &mut plans)?;
    Ok(plans)
}

fn collect_plan(
    ast: &common::query::Ast,
    correlation: Option<&common::query::Correlation>,
    snapshot: &replica::Snapshot,
    plans: &mut Vec<String>,
) -> anyhow::Result<()> {
    let correlation_eq: Vec<(String, SqlValue)> = correlation
        .map(|c| {
            c.child_fields
                .iter()
                .map(|field| (field.clone(), SqlValue::Null))
                .collect()
        })
        .unwrap_or_default();
    let pk_cols = snapshot.pk_columns(&ast.table)?;
    let (sql, _) = build_select(
        &ast.table,
        ast.where_clause.as_ref(),
        &correlation_eq,
        &ast.order_by,
        &pk_cols,
        ast.limit,
    );
    plans.push(sql);
    for related in &ast.related {
        collect_plan(&related.sub_query, Some(&related.correlation), snapshot, plans)?;
    }
    Ok(())
}
