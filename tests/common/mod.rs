#![allow(dead_code)]

use relata::storage::MemoryBackend;
use relata::{
    Database, DatabaseSettings, Entity, EntityDescriptor, FieldType, OrderBy, OrmError, Predicate,
    Query, SchemaRegistry, SyncPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lecturer {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl Entity for Lecturer {
    const NAME: &'static str = "Lecturer";

    fn describe() -> EntityDescriptor {
        EntityDescriptor::builder("Lecturer")
            .identity_key("id")
            .nullable("name", FieldType::Text)
            .nullable("phone", FieldType::Text)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub credits: i64,
    pub lecturer_id: Option<i64>,
}

impl Entity for Module {
    const NAME: &'static str = "Module";

    fn describe() -> EntityDescriptor {
        EntityDescriptor::builder("Module")
            .identity_key("id")
            .nullable("name", FieldType::Text)
            .field("credits", FieldType::Integer)
            .optional_fk("lecturer_id", FieldType::Integer, "Lecturer", "lecturer", "modules")
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Option<i64>,
    pub student_no: Option<String>,
    pub name: String,
    pub email: Option<String>,
}

impl Student {
    pub fn new(student_no: &str, name: &str) -> Self {
        Student {
            id: None,
            student_no: Some(student_no.to_string()),
            name: name.to_string(),
            email: None,
        }
    }
}

impl Entity for Student {
    const NAME: &'static str = "Student";

    fn describe() -> EntityDescriptor {
        EntityDescriptor::builder("Student")
            .identity_key("id")
            .nullable("student_no", FieldType::Text)
            .field("name", FieldType::Text)
            .nullable("email", FieldType::Text)
            .build()
    }
}

/// Required relationship: an enrolment cannot outlive its student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrolment {
    pub id: Option<i64>,
    pub student_id: Option<i64>,
    pub course: String,
}

impl Entity for Enrolment {
    const NAME: &'static str = "Enrolment";

    fn describe() -> EntityDescriptor {
        EntityDescriptor::builder("Enrolment")
            .identity_key("id")
            .required_fk("student_id", FieldType::Integer, "Student", "student", "enrolments")
            .field("course", FieldType::Text)
            .build()
    }
}

/// Optional self-reference: an employee may report to another employee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub id: Option<i64>,
    pub name: String,
    pub manager_id: Option<i64>,
}

impl Employee {
    pub fn new(name: &str) -> Self {
        Employee {
            id: None,
            name: name.to_string(),
            manager_id: None,
        }
    }
}

impl Entity for Employee {
    const NAME: &'static str = "Employee";

    fn describe() -> EntityDescriptor {
        EntityDescriptor::builder("Employee")
            .identity_key("id")
            .field("name", FieldType::Text)
            .optional_fk("manager_id", FieldType::Integer, "Employee", "manager", "reports")
            .build()
    }
}

pub fn staff_registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register_entity::<Employee>().unwrap();
    registry.seal().unwrap()
}

pub fn registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register_entity::<Lecturer>().unwrap();
    registry.register_entity::<Module>().unwrap();
    registry.register_entity::<Student>().unwrap();
    registry.register_entity::<Enrolment>().unwrap();
    registry.seal().unwrap()
}

/// In-memory database with every table created.
pub async fn memory_db() -> (MemoryBackend, Database) {
    let backend = MemoryBackend::new();
    let db = Database::with_backend(Arc::new(backend.clone()), registry());
    db.synchronize(SyncPolicy::CreateIfAbsent).await.unwrap();
    (backend, db)
}

pub fn sqlite_settings(dir: &TempDir) -> DatabaseSettings {
    DatabaseSettings {
        url: format!("sqlite://{}", dir.path().join("college.db").display()),
        max_connections: 2,
        sync_policy: SyncPolicy::RecreateAlways,
    }
}

pub async fn sqlite_db(dir: &TempDir) -> Database {
    Database::initialize(&sqlite_settings(dir), registry())
        .await
        .unwrap()
}

/// Lecturer "GC" with two modules and one unassigned module, then lazy
/// navigation from a fresh session.
pub async fn college_scenario(db: &Database) {
    let mut session = db.open_session().await.unwrap();
    let gc = session
        .set::<Lecturer>()
        .unwrap()
        .add(Lecturer {
            id: None,
            name: Some("GC".to_string()),
            phone: Some("2898".to_string()),
        })
        .unwrap();
    assert_eq!(session.commit().await.unwrap(), 1);
    let gc_id = session.entity(&gc).unwrap().id.expect("generated id");

    {
        let mut modules = session.set::<Module>().unwrap();
        for (name, credits, lecturer_id) in [
            ("Databases", 5, Some(gc_id)),
            ("Programming", 10, Some(gc_id)),
            ("Maths", 5, None),
        ] {
            modules
                .add(Module {
                    id: None,
                    name: Some(name.to_string()),
                    credits,
                    lecturer_id,
                })
                .unwrap();
        }
    }
    assert_eq!(session.commit().await.unwrap(), 3);
    session.close().await.unwrap();

    let mut session = db.open_session().await.unwrap();
    let modules = session
        .set::<Module>()
        .unwrap()
        .query(Predicate::True, &[OrderBy::asc("id")])
        .await
        .unwrap();
    assert_eq!(modules.len(), 3);

    let mut lecturers = Vec::new();
    for module in &modules {
        let lecturer = session
            .load_reference::<Lecturer, _>(module, "lecturer")
            .await
            .unwrap();
        lecturers.push(lecturer.map(|l| session.entity(&l).unwrap().name));
    }
    assert_eq!(
        lecturers,
        vec![Some(Some("GC".to_string())), Some(Some("GC".to_string())), None]
    );

    let lecturer = session
        .set::<Lecturer>()
        .unwrap()
        .find(gc_id)
        .await
        .unwrap()
        .expect("lecturer is stored");
    let taught = session
        .load_collection::<Module, _>(&lecturer, "modules")
        .await
        .unwrap();
    let names: Vec<_> = taught
        .iter()
        .map(|m| session.entity(m).unwrap().name.unwrap())
        .collect();
    assert_eq!(names, vec!["Databases", "Programming"]);

    session.close().await.unwrap();
    let after_close = session
        .load_reference::<Lecturer, _>(&modules[0], "lecturer")
        .await;
    assert!(matches!(after_close, Err(OrmError::DetachedAccess)));
}

/// Unsaved employees linked in an order that insertion cannot follow:
/// Ann and Ben manage each other and Cy manages themself.
pub async fn manager_cycle_scenario(db: &Database) {
    let mut session = db.open_session().await.unwrap();
    let (ann, ben, cy) = {
        let mut staff = session.set::<Employee>().unwrap();
        let ann = staff.add(Employee::new("Ann")).unwrap();
        let ben = staff.add(Employee::new("Ben")).unwrap();
        let cy = staff.add(Employee::new("Cy")).unwrap();
        staff.set_reference(&ann, "manager", Some(&ben)).unwrap();
        staff.set_reference(&ben, "manager", Some(&ann)).unwrap();
        staff.set_reference(&cy, "manager", Some(&cy)).unwrap();
        (ann, ben, cy)
    };
    assert_eq!(session.commit().await.unwrap(), 3);

    let ann = session.entity(&ann).unwrap();
    let ben = session.entity(&ben).unwrap();
    let cy = session.entity(&cy).unwrap();
    assert!(ann.id.is_some() && ben.id.is_some() && cy.id.is_some());
    assert_eq!(ann.manager_id, ben.id);
    assert_eq!(ben.manager_id, ann.id);
    assert_eq!(cy.manager_id, cy.id);
    session.close().await.unwrap();

    let mut check = db.open_session().await.unwrap();
    let stored = check
        .set::<Employee>()
        .unwrap()
        .to_list(&Query::new().order_by("name", true))
        .await
        .unwrap();
    assert_eq!(stored, vec![ann, ben, cy]);
    check.close().await.unwrap();
}
