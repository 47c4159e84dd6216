//! Row-level permission rewrite.
//!
//! A permission policy attaches a select predicate to tables. Applying the
//! policy is a pure structural transformation from `(AST, policy, auth
//! data)` to `(AST, warnings)`: policy predicates are conjoined with any
//! existing filter, auth-data references are resolved to literals, and
//! references with no auth data resolve to the literal `NULL` (which SQL
//! comparison semantics then evaluate to false).

use std::collections::BTreeMap;

use common::{
    query::{
        cmp,
        column,
        literal,
        Ast,
        CmpOp,
        Condition,
        Operand,
    },
    value::SqlValue,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

pub const NO_AUTH_WARNING: &str = "No auth data provided. Permission rules will compare to \
                                   `NULL` wherever an auth data field is referenced.";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default)]
    pub tables: BTreeMap<String, TablePolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<PolicyCondition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PolicyCondition {
    And {
        conditions: Vec<PolicyCondition>,
    },
    Or {
        conditions: Vec<PolicyCondition>,
    },
    Simple {
        left: PolicyOperand,
        op: CmpOp,
        right: PolicyOperand,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PolicyOperand {
    Column { name: String },
    /// A field of the connection's decoded auth token.
    AuthField { field: String },
    Literal { value: SqlValue },
}

impl Permissions {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&TablePolicy> {
        self.tables.get(name)
    }
}

struct Rewriter<'a> {
    auth_data: Option<&'a JsonValue>,
    missing_auth_reference: bool,
}

impl Rewriter<'_> {
    fn resolve_operand(&mut self, operand: &PolicyOperand) -> Operand {
        match operand {
            PolicyOperand::Column { name } => column(name.clone()),
            PolicyOperand::Literal { value } => literal(value.clone()),
            PolicyOperand::AuthField { field } => {
                let resolved = self
                    .auth_data
                    .and_then(|data| data.get(field.as_str()))
                    .cloned();
                match resolved {
                    Some(value) => literal(SqlValue::from_json(value)),
                    None => {
                        self.missing_auth_reference = true;
                        literal(SqlValue::Null)
                    },
                }
            },
        }
    }

    fn resolve_condition(&mut self, condition: &PolicyCondition) -> Condition {
        match condition {
            PolicyCondition::And { conditions } => Condition::And {
                conditions: conditions.iter().map(|c| self.resolve_condition(c)).collect(),
            },
            PolicyCondition::Or { conditions } => Condition::Or {
                conditions: conditions.iter().map(|c| self.resolve_condition(c)).collect(),
            },
            PolicyCondition::Simple { left, op, right } => cmp(
                self.resolve_operand(left),
                *op,
                self.resolve_operand(right),
            ),
        }
    }

    fn rewrite_ast(&mut self, ast: &mut Ast, permissions: &Permissions) {
        if let Some(select) = permissions.table(&ast.table).and_then(|p| p.select.as_ref()) {
            let resolved = self.resolve_condition(select);
            ast.and_where(resolved);
        }
        for related in &mut ast.related {
            self.rewrite_ast(&mut related.sub_query, permissions);
        }
    }
}

/// Rewrite `ast` under `permissions`, resolving auth-data references from
/// `auth_data`. Pure: identical inputs produce a byte-identical AST, so the
/// transformation hash of the result is deterministic.
pub fn apply_permissions(
    mut ast: Ast,
    permissions: &Permissions,
    auth_data: Option<&JsonValue>,
) -> (Ast, Vec<String>) {
    let mut rewriter = Rewriter {
        auth_data,
        missing_auth_reference: false,
    };
    rewriter.rewrite_ast(&mut ast, permissions);
    let mut warnings = Vec::new();
    if rewriter.missing_auth_reference {
        warnings.push(NO_AUTH_WARNING.to_owned());
    }
    (ast, warnings)
}

#[cfg(test)]
mod tests {
    use common::{
        query::{
            Ast,
            CmpOp,
            Correlation,
            RelatedQuery,
        },
        value::SqlValue,
    };
    use pretty_assertions::assert_eq;

    use super::{
        apply_permissions,
        Permissions,
        PolicyCondition,
        PolicyOperand,
        TablePolicy,
        NO_AUTH_WARNING,
    };

    fn admin_only_policy(table: &str) -> Permissions {
        let mut permissions = Permissions::empty();
        permissions.tables.insert(
            table.to_owned(),
            TablePolicy {
                select: Some(PolicyCondition::Simple {
                    left: PolicyOperand::AuthField {
                        field: "role".into(),
                    },
                    op: CmpOp::Eq,
                    right: PolicyOperand::Literal {
                        value: SqlValue::Text("admin".into()),
                    },
                }),
            },
        );
        permissions
    }

    #[test]
    fn test_rewrite_without_auth_compares_to_null() {
        let (ast, warnings) =
            apply_permissions(Ast::table("issues"), &admin_only_policy("issues"), None);
        assert_eq!(ast.to_builder_string(), "issues.where(null, \"admin\")");
        assert_eq!(warnings, vec![NO_AUTH_WARNING.to_owned()]);
    }

    #[test]
    fn test_rewrite_with_auth_substitutes_field() {
        let auth = serde_json::json!({"role": "admin", "sub": "u1"});
        let (ast, warnings) = apply_permissions(
            Ast::table("issues"),
            &admin_only_policy("issues"),
            Some(&auth),
        );
        assert_eq!(ast.to_builder_string(), "issues.where(\"admin\", \"admin\")");
        assert_eq!(warnings, Vec::<String>::new());
    }

    #[test]
    fn test_rewrite_conjoins_with_existing_filter() {
        let mut ast = Ast::table("issues");
        ast.and_where(common::query::cmp(
            common::query::column("open"),
            CmpOp::Eq,
            common::query::literal(SqlValue::Integer(1)),
        ));
        let auth = serde_json::json!({"role": "admin"});
        let (ast, _) = apply_permissions(ast, &admin_only_policy("issues"), Some(&auth));
        assert_eq!(
            ast.to_builder_string(),
            "issues.where(\"open\", 1).where(\"admin\", \"admin\")"
        );
    }

    #[test]
    fn test_rewrite_reaches_related_subqueries() {
        let mut ast = Ast::table("issues");
        ast.related.push(RelatedQuery {
            correlation: Correlation {
                parent_fields: vec!["creatorID".into()],
                child_fields: vec!["id".into()],
            },
            alias: "creator".into(),
            sub_query: Ast::table("users"),
        });
        let (ast, warnings) = apply_permissions(ast, &admin_only_policy("users"), None);
        assert_eq!(
            ast.to_builder_string(),
            "issues.related(\"creator\", users.where(null, \"admin\"))"
        );
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_rewrite_is_deterministic() {
        let auth = serde_json::json!({"role": "admin"});
        let policy = admin_only_policy("issues");
        let (a, _) = apply_permissions(Ast::table("issues"), &policy, Some(&auth));
        let (b, _) = apply_permissions(Ast::table("issues"), &policy, Some(&auth));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.transformation_hash(), b.transformation_hash());
    }

    #[test]
    fn test_no_policy_is_identity() {
        let ast = Ast::table("issues");
        let before = ast.canonical_bytes();
        let (after, warnings) = apply_permissions(ast, &Permissions::empty(), None);
        assert_eq!(after.canonical_bytes(), before);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_warning_emitted_once_for_many_references() {
        let mut permissions = admin_only_policy("issues");
        permissions.tables.insert(
            "users".into(),
            permissions.tables.get("issues").unwrap().clone(),
        );
        let mut ast = Ast::table("issues");
        ast.related.push(RelatedQuery {
            correlation: Correlation {
                parent_fields: vec!["creatorID".into()],
                child_fields: vec!["id".into()],
            },
            alias: "creator".into(),
            sub_query: Ast::table("users"),
        });
        let (_, warnings) = apply_permissions(ast, &permissions, None);
        assert_eq!(warnings.len(), 1);
    }
}
