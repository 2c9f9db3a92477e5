use meshcat::catalog::Catalog;
use meshcat::catalog::invalidation::NullSink;
use meshcat::catalog::schema_registry::{
    CompatibilityClass, FieldDef, FieldType, RegisterOutcome,
};
use meshcat::core::config::CatalogConfig;
use meshcat::core::error::CatalogError;
use std::sync::Arc;
use tempfile::tempdir;

fn test_catalog() -> (tempfile::TempDir, Catalog) {
    let tmp = tempdir().expect("tempdir");
    let catalog = Catalog::open_with(tmp.path(), CatalogConfig::default(), Arc::new(NullSink))
        .expect("open catalog");
    (tmp, catalog)
}

fn customer_v1() -> Vec<FieldDef> {
    vec![
        FieldDef::optional("id", FieldType::String),
        FieldDef::required("email", FieldType::String).with_pii(),
        FieldDef::required("name", FieldType::String),
    ]
}

#[test]
fn test_removing_a_required_field_is_rejected_and_relaxing_is_accepted() {
    let (_tmp, catalog) = test_catalog();
    let v1 = catalog
        .register_schema("customer", 1, &customer_v1(), None)
        .expect("v1");
    assert_eq!(
        v1,
        RegisterOutcome::Accepted {
            entity_type: "customer".to_string(),
            version: 1,
            idempotent: false,
        }
    );

    let dropped_name = [
        FieldDef::optional("id", FieldType::String),
        FieldDef::required("email", FieldType::String).with_pii(),
    ];
    match catalog
        .register_schema("customer", 2, &dropped_name, None)
        .expect("v2 attempt")
    {
        RegisterOutcome::Rejected {
            version, fields, ..
        } => {
            assert_eq!(version, 2);
            assert_eq!(fields, vec!["name".to_string()]);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    // A rejected version leaves nothing behind.
    assert_eq!(catalog.list_schemas("customer").unwrap().len(), 1);

    let relaxed = [
        FieldDef::optional("id", FieldType::String),
        FieldDef::required("email", FieldType::String).with_pii(),
        FieldDef::optional("name", FieldType::String),
        FieldDef::optional("phone", FieldType::String),
    ];
    assert!(
        catalog
            .register_schema("customer", 2, &relaxed, None)
            .unwrap()
            .is_accepted()
    );

    let latest = catalog.get_schema("customer", None).unwrap();
    assert_eq!(latest.version, 2);
    assert!(!latest.field("name").unwrap().required);
    assert!(latest.field("email").unwrap().pii);
    let v1 = catalog.get_schema("customer", Some(1)).unwrap();
    assert!(v1.field("name").unwrap().required);
    assert_eq!(
        catalog
            .list_schemas("customer")
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[test]
fn test_reregistering_the_same_definition_is_idempotent() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .register_schema("customer", 1, &customer_v1(), None)
        .unwrap();
    let again = catalog
        .register_schema("customer", 1, &customer_v1(), None)
        .unwrap();
    assert_eq!(
        again,
        RegisterOutcome::Accepted {
            entity_type: "customer".to_string(),
            version: 1,
            idempotent: true,
        }
    );

    let mut changed = customer_v1();
    changed.push(FieldDef::optional("extra", FieldType::Int));
    let clash = catalog
        .register_schema("customer", 1, &changed, None)
        .unwrap();
    assert!(!clash.is_accepted());
    assert!(matches!(
        clash.into_result(),
        Err(CatalogError::SchemaConflict { .. })
    ));
}

#[test]
fn test_versions_must_increase() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .register_schema("customer", 3, &customer_v1(), None)
        .unwrap();
    let older = catalog
        .register_schema("customer", 2, &customer_v1(), None)
        .unwrap();
    assert!(!older.is_accepted());
    assert!(matches!(
        catalog.register_schema("customer", 0, &customer_v1(), None),
        Err(CatalogError::ValidationError(_))
    ));
}

#[test]
fn test_type_changes_must_widen() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .register_schema(
            "metric",
            1,
            &[FieldDef::required("value", FieldType::Int)],
            None,
        )
        .unwrap();

    let narrowed = catalog
        .register_schema(
            "metric",
            2,
            &[FieldDef::required("value", FieldType::Bool)],
            None,
        )
        .unwrap();
    assert!(!narrowed.is_accepted());

    let widened = catalog
        .register_schema(
            "metric",
            2,
            &[FieldDef::required("value", FieldType::Float)],
            None,
        )
        .unwrap();
    assert!(widened.is_accepted());
}

#[test]
fn test_full_compatibility_is_stricter() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .register_schema(
            "ledger",
            1,
            &[
                FieldDef::required("amount", FieldType::Int),
                FieldDef::optional("memo", FieldType::String),
            ],
            Some(CompatibilityClass::Full),
        )
        .unwrap();

    let dropped_optional = catalog
        .register_schema(
            "ledger",
            2,
            &[FieldDef::required("amount", FieldType::Int)],
            Some(CompatibilityClass::Full),
        )
        .unwrap();
    assert!(!dropped_optional.is_accepted());

    let added_optional = catalog
        .register_schema(
            "ledger",
            2,
            &[
                FieldDef::required("amount", FieldType::Int),
                FieldDef::optional("memo", FieldType::String),
                FieldDef::optional("currency", FieldType::String),
            ],
            Some(CompatibilityClass::Full),
        )
        .unwrap();
    assert!(added_optional.is_accepted());
    assert_eq!(
        catalog.get_schema("ledger", None).unwrap().compatibility_class,
        CompatibilityClass::Full
    );
}

#[test]
fn test_adding_a_required_field_is_rejected() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .register_schema("customer", 1, &customer_v1(), None)
        .unwrap();
    let mut fields = customer_v1();
    fields.push(FieldDef::required("country", FieldType::String));
    match catalog.register_schema("customer", 2, &fields, None).unwrap() {
        RegisterOutcome::Rejected { fields, .. } => {
            assert_eq!(fields, vec!["country".to_string()])
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn test_malformed_definitions_are_validation_errors() {
    let (_tmp, catalog) = test_catalog();
    assert!(matches!(
        catalog.register_schema("customer", 1, &[], None),
        Err(CatalogError::ValidationError(_))
    ));
    let dup = [
        FieldDef::optional("a", FieldType::String),
        FieldDef::optional("a", FieldType::Int),
    ];
    assert!(matches!(
        catalog.register_schema("customer", 1, &dup, None),
        Err(CatalogError::ValidationError(_))
    ));
    let bad_ref = [FieldDef::optional("owner", FieldType::Int).referencing("team")];
    assert!(matches!(
        catalog.register_schema("customer", 1, &bad_ref, None),
        Err(CatalogError::ValidationError(_))
    ));
    assert!(matches!(
        catalog.register_schema("not a type", 1, &customer_v1(), None),
        Err(CatalogError::ValidationError(_))
    ));
}

#[test]
fn test_unknown_schemas_are_not_found() {
    let (_tmp, catalog) = test_catalog();
    assert!(matches!(
        catalog.get_schema("customer", None),
        Err(CatalogError::NotFound(_))
    ));
    catalog
        .register_schema("customer", 1, &customer_v1(), None)
        .unwrap();
    assert!(matches!(
        catalog.get_schema("customer", Some(9)),
        Err(CatalogError::NotFound(_))
    ));
    assert!(catalog.list_schemas("order").unwrap().is_empty());
}
