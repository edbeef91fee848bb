use relata::{Entity, EntityDescriptor, EntityRegistration, FieldType, SchemaRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct Course {
    code: String,
    title: String,
    teacher_id: Option<i64>,
}

impl Entity for Course {
    const NAME: &'static str = "Course";

    fn describe() -> EntityDescriptor {
        EntityDescriptor::builder("Course")
            .key("code", FieldType::Text)
            .field("title", FieldType::Text)
            .optional_fk("teacher_id", FieldType::Integer, "Teacher", "teacher", "courses")
            .build()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Teacher {
    id: Option<i64>,
    name: String,
}

impl Entity for Teacher {
    const NAME: &'static str = "Teacher";

    fn describe() -> EntityDescriptor {
        EntityDescriptor::builder("Teacher")
            .identity_key("id")
            .field("name", FieldType::Text)
            .build()
    }
}

inventory::submit! { EntityRegistration(Course::describe) }
inventory::submit! { EntityRegistration(Teacher::describe) }

#[test]
fn test_global_registry_collects_submitted_entities() {
    let registry = SchemaRegistry::global().unwrap();
    assert_eq!(registry.len(), 2);
    let course = registry.describe("Course").unwrap();
    assert_eq!(course.table, "courses");
    assert_eq!(course.relationships[0].principal_table, "teachers");

    let again = SchemaRegistry::global().unwrap();
    assert!(Arc::ptr_eq(&registry, &again));
}
