//! Comparison of a service's fields with an existing destination layer.

use crate::service::{FieldSpec, GEOMETRY_FIELD};
use crate::store::{ColumnKind, StoreColumn};
use std::collections::BTreeSet;

/// Destination column names that take part in the comparison, `Shape@` first.
///
/// Identity, global id and geometry columns, anything named like a shape
/// column and user-managed fields are left out.
pub fn comparable_columns(columns: &[StoreColumn], user_fields: &[String]) -> Vec<String> {
    let mut names = vec![GEOMETRY_FIELD.to_string()];
    names.extend(
        columns
            .iter()
            .filter(|c| matches!(c.kind, ColumnKind::Attribute(_)))
            .filter(|c| !c.name.to_ascii_lowercase().contains("shape"))
            .filter(|c| !user_fields.iter().any(|u| u.eq_ignore_ascii_case(&c.name)))
            .map(|c| c.name.clone()),
    );
    names
}

/// True when the destination holds exactly the service's fields.
pub fn reconcile(fields: &[FieldSpec], columns: &[StoreColumn], user_fields: &[String]) -> bool {
    let mut expected: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    let comparable = comparable_columns(columns, user_fields);
    let mut actual: Vec<&str> = comparable.iter().map(String::as_str).collect();
    expected.sort_unstable();
    actual.sort_unstable();
    expected == actual
}

/// Names present on only one side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Service fields the destination lacks.
    pub missing: Vec<String>,
    /// Destination columns the service does not have.
    pub unexpected: Vec<String>,
}

impl SchemaDiff {
    pub fn compare(fields: &[FieldSpec], columns: &[StoreColumn], user_fields: &[String]) -> Self {
        let expected: BTreeSet<String> = fields.iter().map(|f| f.name.clone()).collect();
        let actual: BTreeSet<String> = comparable_columns(columns, user_fields).into_iter().collect();
        Self {
            missing: expected.difference(&actual).cloned().collect(),
            unexpected: actual.difference(&expected).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::EsriFieldType;
    use crate::types::ColumnType;

    fn fields(names: &[&str]) -> Vec<FieldSpec> {
        let mut fields = vec![FieldSpec::geometry()];
        fields.extend(names.iter().map(|name| FieldSpec {
            name: name.to_string(),
            field_type: EsriFieldType::String,
            length: None,
        }));
        fields
    }

    fn destination(extra: &[&str]) -> Vec<StoreColumn> {
        let mut columns = vec![
            StoreColumn::new("fid", ColumnKind::Identity),
            StoreColumn::new("shape", ColumnKind::Geometry),
            StoreColumn::new("GlobalID", ColumnKind::GlobalId),
            StoreColumn::new("Shape_Area", ColumnKind::Attribute(ColumnType::Double)),
        ];
        columns.extend(
            extra
                .iter()
                .map(|name| StoreColumn::new(*name, ColumnKind::Attribute(ColumnType::Varchar))),
        );
        columns
    }

    #[test]
    fn matching_schema_ignores_order_and_system_columns() {
        let fields = fields(&["name", "kind"]);
        let columns = destination(&["kind", "name"]);
        assert!(reconcile(&fields, &columns, &[]));
        assert!(SchemaDiff::compare(&fields, &columns, &[]).is_empty());
    }

    #[test]
    fn user_fields_are_ignored() {
        let fields = fields(&["name"]);
        let columns = destination(&["name", "notes"]);
        assert!(!reconcile(&fields, &columns, &[]));
        assert!(reconcile(&fields, &columns, &["NOTES".to_string()]));
    }

    #[test]
    fn diff_names_both_sides() {
        let fields = fields(&["name", "height"]);
        let columns = destination(&["name", "legacy_code"]);
        assert!(!reconcile(&fields, &columns, &[]));

        let diff = SchemaDiff::compare(&fields, &columns, &[]);
        assert_eq!(diff.missing, vec!["height"]);
        assert_eq!(diff.unexpected, vec!["legacy_code"]);
    }

    #[test]
    fn duplicate_columns_do_not_match() {
        let fields = fields(&["name"]);
        let columns = destination(&["name", "name"]);
        assert!(!reconcile(&fields, &columns, &[]));
    }
}
