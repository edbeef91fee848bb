mod common;

use common::{Enrolment, Lecturer, Module, Student};
use relata::{Entity, EntityDescriptor, FieldType, OrmError, SchemaRegistry};
use std::collections::BTreeSet;

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_register_and_describe() {
    let registry = common::registry();
    assert_eq!(registry.len(), 4);
    let module = registry.describe("Module").unwrap();
    assert_eq!(module.table, "modules");
    assert_eq!(module.primary_key, "id");
    assert!(module.identity);
    let rel = &module.relationships[0];
    assert!(rel.optional);
    assert_eq!(rel.principal_table, "lecturers");
    assert_eq!(rel.principal_key, "id");

    assert!(matches!(
        registry.describe("Course"),
        Err(OrmError::UnknownEntity(name)) if name == "Course"
    ));
}

#[test]
fn test_duplicate_registration_fails() {
    let mut registry = SchemaRegistry::new();
    registry.register_entity::<Student>().unwrap();
    assert!(matches!(
        registry.register_entity::<Student>(),
        Err(OrmError::DuplicateEntity(name)) if name == "Student"
    ));

    let same_table = EntityDescriptor::builder("Pupil")
        .table("students")
        .identity_key("id")
        .build();
    assert!(matches!(
        registry.register(same_table),
        Err(OrmError::InvalidDescriptor { .. })
    ));
}

#[test]
fn test_invalid_descriptors_are_rejected() {
    let mut registry = SchemaRegistry::new();
    let no_key = EntityDescriptor::builder("Note")
        .field("body", FieldType::Text)
        .build();
    assert!(matches!(
        registry.register(no_key),
        Err(OrmError::InvalidDescriptor { .. })
    ));

    let bad_name = EntityDescriptor::builder("Note")
        .identity_key("id")
        .field("body text", FieldType::Text)
        .build();
    assert!(matches!(
        registry.register(bad_name),
        Err(OrmError::InvalidDescriptor { .. })
    ));

    let twice = EntityDescriptor::builder("Note")
        .identity_key("id")
        .field("body", FieldType::Text)
        .nullable("body", FieldType::Text)
        .build();
    assert!(matches!(
        registry.register(twice),
        Err(OrmError::InvalidDescriptor { .. })
    ));

    let real_key = EntityDescriptor::builder("Note")
        .key("id", FieldType::Real)
        .build();
    assert!(matches!(
        registry.register(real_key),
        Err(OrmError::InvalidDescriptor { .. })
    ));
    assert!(registry.is_empty());
}

#[test]
fn test_seal_checks_foreign_key_types() {
    let mut registry = SchemaRegistry::new();
    registry.register_entity::<Lecturer>().unwrap();
    registry
        .register(
            EntityDescriptor::builder("Module")
                .identity_key("id")
                .optional_fk("lecturer_id", FieldType::Text, "Lecturer", "lecturer", "modules")
                .build(),
        )
        .unwrap();
    assert!(matches!(
        registry.seal(),
        Err(OrmError::InvalidDescriptor { entity, .. }) if entity == "Module"
    ));

    let mut registry = SchemaRegistry::new();
    registry.register_entity::<Module>().unwrap();
    assert!(matches!(
        registry.seal(),
        Err(OrmError::UnknownEntity(name)) if name == "Lecturer"
    ));
}

#[test]
fn test_dependency_order_puts_principals_first() {
    let registry = common::registry();
    let order = registry
        .dependency_order(&names(&[Enrolment::NAME, Module::NAME, Student::NAME, Lecturer::NAME]))
        .unwrap();
    let position = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert!(position("Lecturer") < position("Module"));
    assert!(position("Student") < position("Enrolment"));
    assert_eq!(order.len(), 4);
}

fn cyclic(optional: bool) -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    let department = EntityDescriptor::builder("Department")
        .identity_key("id")
        .optional_fk("head_id", FieldType::Integer, "Staff", "head", "headed");
    let staff = EntityDescriptor::builder("Staff").identity_key("id");
    let staff = if optional {
        staff.optional_fk("department_id", FieldType::Integer, "Department", "department", "staff")
    } else {
        staff.required_fk("department_id", FieldType::Integer, "Department", "department", "staff")
    };
    registry.register(department.build()).unwrap();
    registry.register(staff.build()).unwrap();
    registry
}

#[test]
fn test_optional_cycle_is_broken() {
    let registry = cyclic(false).seal().unwrap();
    let order = registry
        .dependency_order(&names(&["Department", "Staff"]))
        .unwrap();
    assert_eq!(order, vec!["Department".to_string(), "Staff".to_string()]);
}

#[test]
fn test_required_cycle_is_reported() {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityDescriptor::builder("Chicken")
                .identity_key("id")
                .required_fk("egg_id", FieldType::Integer, "Egg", "egg", "chickens")
                .build(),
        )
        .unwrap();
    registry
        .register(
            EntityDescriptor::builder("Egg")
                .identity_key("id")
                .required_fk("chicken_id", FieldType::Integer, "Chicken", "chicken", "eggs")
                .build(),
        )
        .unwrap();
    let registry = registry.seal().unwrap();
    match registry.dependency_order(&names(&["Chicken", "Egg"])) {
        Err(OrmError::CyclicDependency(members)) => {
            assert_eq!(members, vec!["Chicken".to_string(), "Egg".to_string()])
        }
        other => panic!("expected CyclicDependency, got {:?}", other),
    }
}

#[test]
fn test_fingerprint_tracks_schema() {
    let a = common::registry().fingerprint();
    let b = common::registry().fingerprint();
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);

    let both_optional = cyclic(true).seal().unwrap().fingerprint();
    let one_required = cyclic(false).seal().unwrap().fingerprint();
    assert_ne!(both_optional, one_required);
}

#[test]
fn test_navigation_lookup() {
    let registry = common::registry();
    let (rel, is_dependent) = registry.navigation("Module", "lecturer").unwrap();
    assert!(is_dependent);
    assert_eq!(rel.principal, "Lecturer");
    let (rel, is_dependent) = registry.navigation("Lecturer", "modules").unwrap();
    assert!(!is_dependent);
    assert_eq!(rel.dependent, "Module");
    assert!(matches!(
        registry.navigation("Lecturer", "students"),
        Err(OrmError::UnknownNavigation { .. })
    ));
}

#[test]
fn test_entity_row_mapping() {
    let descriptor = Student::describe();
    let student = Student::new("X00001111", "Alice");
    let row = descriptor.to_row(&student).unwrap();
    assert_eq!(
        row,
        vec![
            relata::Value::Null,
            relata::Value::from("X00001111"),
            relata::Value::from("Alice"),
            relata::Value::Null,
        ]
    );
    let back: Student = descriptor.from_row(&row).unwrap();
    assert_eq!(back, student);

    let module = Module::describe();
    let bad = serde_json::json!({ "id": 1, "name": "Maths", "credits": "five", "lecturer_id": null });
    assert!(matches!(
        module.to_row(&bad),
        Err(OrmError::InvalidValue { field, .. }) if field == "credits"
    ));
}
