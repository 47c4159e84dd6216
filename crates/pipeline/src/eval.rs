use common::{
    query::{
        CmpOp,
        Condition,
        Operand,
    },
    value::{
        RowData,
        SqlValue,
    },
};

fn operand_value<'a>(operand: &'a Operand, row: &'a RowData) -> &'a SqlValue {
    match operand {
        Operand::Column { name } => row.get(name).unwrap_or(&SqlValue::Null),
        Operand::Literal { value } => value,
    }
}

/// Evaluate a filter against a row with SQL comparison semantics: `NULL`
/// compares equal to nothing, including itself, and a predicate that
/// evaluates to unknown is collapsed to false for inclusion.
pub fn eval_condition(condition: &Condition, row: &RowData) -> bool {
    match condition {
        Condition::And { conditions } => conditions.iter().all(|c| eval_condition(c, row)),
        Condition::Or { conditions } => conditions.iter().any(|c| eval_condition(c, row)),
        Condition::Simple { left, op, right } => {
            let left = operand_value(left, row);
            let right = operand_value(right, row);
            let result = match op {
                CmpOp::Eq => left.sql_eq(right),
                CmpOp::Ne => left.sql_eq(right).map(|eq| !eq),
                CmpOp::Lt => left.sql_cmp(right).map(|o| o.is_lt()),
                CmpOp::Le => left.sql_cmp(right).map(|o| o.is_le()),
                CmpOp::Gt => left.sql_cmp(right).map(|o| o.is_gt()),
                CmpOp::Ge => left.sql_cmp(right).map(|o| o.is_ge()),
            };
            result.unwrap_or(false)
        },
    }
}

#[cfg(test)]
mod tests {
    use common::{
        query::{
            cmp,
            column,
            literal,
            CmpOp,
            Condition,
        },
        value::{
            RowData,
            SqlValue,
        },
    };

    use super::eval_condition;

    fn row(pairs: &[(&str, SqlValue)]) -> RowData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_null_predicates_are_false() {
        let r = row(&[("a", SqlValue::Null)]);
        let eq_null = cmp(column("a"), CmpOp::Eq, literal(SqlValue::Null));
        assert!(!eval_condition(&eq_null, &r));
        let ne_null = cmp(column("a"), CmpOp::Ne, literal(SqlValue::Null));
        assert!(!eval_condition(&ne_null, &r));
        // Missing columns read as NULL.
        let missing = cmp(column("nope"), CmpOp::Eq, literal(SqlValue::Integer(1)));
        assert!(!eval_condition(&missing, &r));
    }

    #[test]
    fn test_comparisons() {
        let r = row(&[("n", SqlValue::Integer(5))]);
        assert!(eval_condition(
            &cmp(column("n"), CmpOp::Ge, literal(SqlValue::Integer(5))),
            &r
        ));
        assert!(eval_condition(
            &cmp(column("n"), CmpOp::Lt, literal(SqlValue::Real(5.5))),
            &r
        ));
        assert!(!eval_condition(
            &cmp(column("n"), CmpOp::Ne, literal(SqlValue::Integer(5))),
            &r
        ));
    }

    #[test]
    fn test_composites_collapse_unknown() {
        let r = row(&[("a", SqlValue::Null), ("b", SqlValue::Integer(1))]);
        let unknown = cmp(column("a"), CmpOp::Eq, literal(SqlValue::Integer(1)));
        let true_leg = cmp(column("b"), CmpOp::Eq, literal(SqlValue::Integer(1)));
        assert!(eval_condition(
            &Condition::Or {
                conditions: vec![unknown.clone(), true_leg.clone()]
            },
            &r
        ));
        assert!(!eval_condition(
            &Condition::And {
                conditions: vec![unknown, true_leg]
            },
            &r
        ));
    }
}
