//! Metadata predicates shared by filters and the optimizer.

use hdql_dsl::{Comparison, Literal};
use hdql_store::{Entity, MetaValue};

/// Fields every entity answers to without carrying them as metadata.
pub const PSEUDO_FIELDS: [&str; 2] = ["entity_type", "id"];

pub fn is_pseudo_field(field: &str) -> bool {
    PSEUDO_FIELDS.contains(&field)
}

pub fn literal_value(literal: &Literal) -> MetaValue {
    match literal {
        Literal::Bool(b) => MetaValue::Bool(*b),
        Literal::Number(n) => MetaValue::Number(*n),
        Literal::Text(s) => MetaValue::Text(s.clone()),
    }
}

pub fn field_value(entity: &Entity, field: &str) -> Option<MetaValue> {
    match field {
        "entity_type" => Some(MetaValue::Text(entity.entity_type.clone())),
        "id" => Some(MetaValue::Text(entity.id.clone())),
        _ => entity.metadata.get(field).cloned(),
    }
}

/// `true` when the entity's field satisfies the comparison. Missing fields
/// and values of a different kind never match.
pub fn holds(entity: &Entity, comparison: &Comparison) -> bool {
    let Some(value) = field_value(entity, &comparison.field) else {
        return false;
    };
    value
        .partial_cmp_same_kind(&literal_value(&comparison.value))
        .is_some_and(|ordering| comparison.op.holds(ordering))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdql_dsl::CmpOp;

    fn cmp(field: &str, op: CmpOp, value: Literal) -> Comparison {
        Comparison {
            field: field.into(),
            op,
            value,
        }
    }

    #[test]
    fn numeric_and_text_comparisons() {
        let e = Entity::new("feature", "cache", vec![1.0])
            .with_meta("effort", MetaValue::Number(4.0))
            .with_meta("status", MetaValue::Text("done".into()));
        assert!(holds(&e, &cmp("effort", CmpOp::Le, Literal::Number(4.0))));
        assert!(!holds(&e, &cmp("effort", CmpOp::Gt, Literal::Number(4.0))));
        assert!(holds(&e, &cmp("status", CmpOp::Eq, Literal::Text("done".into()))));
        assert!(holds(&e, &cmp("id", CmpOp::Eq, Literal::Text("cache".into()))));
        assert!(holds(&e, &cmp("entity_type", CmpOp::Ne, Literal::Text("job".into()))));
    }

    #[test]
    fn kind_mismatch_never_matches() {
        let e = Entity::new("feature", "cache", vec![1.0]).with_meta("effort", MetaValue::Number(4.0));
        assert!(!holds(&e, &cmp("effort", CmpOp::Ne, Literal::Text("4".into()))));
        assert!(!holds(&e, &cmp("missing", CmpOp::Ne, Literal::Number(1.0))));
    }
}
