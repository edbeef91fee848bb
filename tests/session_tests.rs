mod common;

use common::{Employee, Enrolment, Lecturer, Module, Student, memory_db, staff_registry};
use relata::storage::{MemoryBackend, StorageOp};
use relata::{
    Database, EntityState, KeyValue, OrderBy, OrmError, Predicate, Query, StorageErrorKind,
    SyncPolicy,
};
use std::sync::Arc;

#[tokio::test]
async fn test_college_scenario_in_memory() {
    let (_backend, db) = memory_db().await;
    common::college_scenario(&db).await;
}

#[tokio::test]
async fn test_tracking_same_key_twice_fails() {
    let (_backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let mut students = session.set::<Student>().unwrap();

    let mut alice = Student::new("X00001111", "Alice");
    alice.id = Some(7);
    students.add(alice.clone()).unwrap();
    let again = students.add(alice.clone());
    assert!(matches!(again, Err(OrmError::AlreadyTracked { .. })));

    let mut bob = Student::new("X00002222", "Bob");
    bob.id = Some(8);
    students.attach(bob.clone()).unwrap();
    assert!(matches!(
        students.add(bob),
        Err(OrmError::AlreadyTracked { .. })
    ));
}

#[tokio::test]
async fn test_principal_inserted_before_dependent() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();

    // the dependent is added first on purpose
    let enrolment = session
        .set::<Enrolment>()
        .unwrap()
        .add(Enrolment {
            id: None,
            student_id: None,
            course: "Databases".to_string(),
        })
        .unwrap();
    let student = session
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();
    session
        .set::<Enrolment>()
        .unwrap()
        .set_reference(&enrolment, "student", Some(&student))
        .unwrap();
    session
        .set::<Lecturer>()
        .unwrap()
        .add(Lecturer {
            id: None,
            name: Some("GC".to_string()),
            phone: None,
        })
        .unwrap();

    let order: Vec<String> = session
        .tracker()
        .pending_operations()
        .unwrap()
        .iter()
        .map(|(entry, _)| entry.entity().to_string())
        .collect();
    let position = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert!(position("Student") < position("Enrolment"));

    assert_eq!(session.commit().await.unwrap(), 3);
    let saved = session.entity(&enrolment).unwrap();
    let student_key = session.set::<Student>().unwrap().key(&student).unwrap();
    assert_eq!(saved.student_id.map(KeyValue::from), student_key);
    assert_eq!(backend.row_count("enrolments"), 1);
    assert_eq!(session.state(&enrolment), EntityState::Unchanged);
}

#[tokio::test]
async fn test_failed_commit_persists_nothing() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let (alice, bob) = {
        let mut students = session.set::<Student>().unwrap();
        (
            students.add(Student::new("X00001111", "Alice")).unwrap(),
            students.add(Student::new("X00002222", "Bob")).unwrap(),
        )
    };

    backend.fail_after(StorageOp::Insert, 1);
    let result = session.commit().await;
    match result {
        Err(OrmError::CommitFailed(cause)) => assert_eq!(cause.kind, StorageErrorKind::Internal),
        other => panic!("expected CommitFailed, got {:?}", other),
    }
    assert_eq!(backend.row_count("students"), 0);
    assert_eq!(session.state(&alice), EntityState::Added);
    assert_eq!(session.state(&bob), EntityState::Added);

    // the tracker is untouched, so a retry goes through
    assert_eq!(session.commit().await.unwrap(), 2);
    assert_eq!(backend.row_count("students"), 2);
}

#[tokio::test]
async fn test_failed_transaction_commit_rolls_back() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let alice = session
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();

    backend.fail_after(StorageOp::Commit, 0);
    assert!(matches!(
        session.commit().await,
        Err(OrmError::CommitFailed(_))
    ));
    assert_eq!(backend.row_count("students"), 0);
    assert_eq!(session.state(&alice), EntityState::Added);
}

#[tokio::test]
async fn test_removing_added_entity_issues_no_delete() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let mut students = session.set::<Student>().unwrap();
    let alice = students.add(Student::new("X00001111", "Alice")).unwrap();
    students.remove(&alice).unwrap();
    assert_eq!(students.state(&alice), EntityState::Detached);

    assert_eq!(session.commit().await.unwrap(), 0);
    assert_eq!(backend.operation_count(StorageOp::Delete), 0);
    assert_eq!(backend.operation_count(StorageOp::Insert), 0);
    assert!(session.tracker().is_empty());
}

#[tokio::test]
async fn test_student_crud() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let alice = session
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();
    session.commit().await.unwrap();

    {
        let mut students = session.set::<Student>().unwrap();
        students
            .update(&alice, |s| s.email = Some("alice@college.ie".to_string()))
            .unwrap();
        assert_eq!(students.state(&alice), EntityState::Modified);
    }
    assert_eq!(session.commit().await.unwrap(), 1);
    assert_eq!(session.state(&alice), EntityState::Unchanged);
    session.close().await.unwrap();

    let mut session = db.open_session().await.unwrap();
    let mut students = session.set::<Student>().unwrap();
    let found = students
        .first(&Query::new().filter(Predicate::eq("student_no", "X00001111")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        students.get(&found).unwrap().email.as_deref(),
        Some("alice@college.ie")
    );
    students.remove(&found).unwrap();
    assert_eq!(students.state(&found), EntityState::Deleted);
    session.commit().await.unwrap();
    assert_eq!(backend.row_count("students"), 0);
    assert_eq!(session.state(&found), EntityState::Detached);
}

#[tokio::test]
async fn test_update_without_change_stays_unchanged() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let alice = session
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();
    session.commit().await.unwrap();

    let mut students = session.set::<Student>().unwrap();
    students.update(&alice, |s| s.name = "Alice".to_string()).unwrap();
    assert_eq!(students.state(&alice), EntityState::Unchanged);
    students.mark_modified(&alice).unwrap();
    students.mark_modified(&alice).unwrap();
    assert_eq!(students.state(&alice), EntityState::Modified);

    assert_eq!(session.commit().await.unwrap(), 1);
    assert_eq!(backend.operation_count(StorageOp::Update), 1);
}

#[tokio::test]
async fn test_stored_key_cannot_change() {
    let (_backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let alice = session
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();
    session.commit().await.unwrap();

    let result = session
        .set::<Student>()
        .unwrap()
        .update(&alice, |s| s.id = Some(99));
    assert!(matches!(result, Err(OrmError::InvalidValue { .. })));
}

#[tokio::test]
async fn test_remove_cascades_to_tracked_dependents() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let student = session
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();
    let enrolment = session
        .set::<Enrolment>()
        .unwrap()
        .add(Enrolment {
            id: None,
            student_id: None,
            course: "Databases".to_string(),
        })
        .unwrap();
    session
        .set::<Enrolment>()
        .unwrap()
        .set_reference(&enrolment, "student", Some(&student))
        .unwrap();
    let gc = session
        .set::<Lecturer>()
        .unwrap()
        .add(Lecturer {
            id: None,
            name: Some("GC".to_string()),
            phone: None,
        })
        .unwrap();
    let maths = session
        .set::<Module>()
        .unwrap()
        .add(Module {
            id: None,
            name: Some("Maths".to_string()),
            credits: 5,
            lecturer_id: None,
        })
        .unwrap();
    session
        .set::<Module>()
        .unwrap()
        .set_reference(&maths, "lecturer", Some(&gc))
        .unwrap();
    assert_eq!(session.commit().await.unwrap(), 4);

    session.set::<Student>().unwrap().remove(&student).unwrap();
    assert_eq!(session.state(&enrolment), EntityState::Deleted);
    session.set::<Lecturer>().unwrap().remove(&gc).unwrap();
    assert_eq!(session.state(&maths), EntityState::Modified);
    assert_eq!(session.entity(&maths).unwrap().lecturer_id, None);

    assert_eq!(session.commit().await.unwrap(), 4);
    assert_eq!(backend.row_count("enrolments"), 0);
    assert_eq!(backend.row_count("students"), 0);
    assert_eq!(backend.row_count("lecturers"), 0);
    assert_eq!(backend.row_count("modules"), 1);
}

#[tokio::test]
async fn test_required_reference_must_be_set_before_commit() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    session
        .set::<Enrolment>()
        .unwrap()
        .add(Enrolment {
            id: None,
            student_id: None,
            course: "Databases".to_string(),
        })
        .unwrap();
    let result = session.commit().await;
    assert!(matches!(result, Err(OrmError::InvalidValue { .. })));
    assert_eq!(backend.operation_count(StorageOp::Insert), 0);
}

#[tokio::test]
async fn test_closed_session_rejects_storage_access() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    assert_eq!(backend.open_connections(), 1);
    let alice = session
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(session.is_closed());
    assert_eq!(backend.open_connections(), 0);

    assert!(matches!(session.commit().await, Err(OrmError::DetachedAccess)));
    let query = session
        .set::<Student>()
        .unwrap()
        .query(Predicate::True, &[])
        .await;
    assert!(matches!(query, Err(OrmError::DetachedAccess)));
    // tracked values stay readable
    assert_eq!(session.entity(&alice).unwrap().name, "Alice");
}

#[tokio::test]
async fn test_dropped_session_releases_connection() {
    let (backend, db) = memory_db().await;
    {
        let mut session = db.open_session().await.unwrap();
        session
            .set::<Student>()
            .unwrap()
            .add(Student::new("X00001111", "Alice"))
            .unwrap();
    }
    assert_eq!(backend.open_connections(), 0);
    assert_eq!(backend.row_count("students"), 0);
}

#[tokio::test]
async fn test_open_reports_connection_error() {
    let (backend, db) = memory_db().await;
    backend.fail_after(StorageOp::Connect, 0);
    match db.open_session().await {
        Err(OrmError::ConnectionError(cause)) => {
            assert_eq!(cause.kind, StorageErrorKind::Connection)
        }
        Err(other) => panic!("expected ConnectionError, got {:?}", other),
        Ok(_) => panic!("expected ConnectionError"),
    }
}

#[tokio::test]
async fn test_handles_are_bound_to_their_session() {
    let (_backend, db) = memory_db().await;
    let mut first = db.open_session().await.unwrap();
    let mut second = db.open_session().await.unwrap();
    let alice = first
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();
    assert!(matches!(second.entity(&alice), Err(OrmError::NotTracked)));
    assert_eq!(second.state(&alice), EntityState::Detached);
    second.close().await.unwrap();
    first.close().await.unwrap();
}

#[tokio::test]
async fn test_query_resolves_identity() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    {
        let mut students = session.set::<Student>().unwrap();
        students.add(Student::new("X00003333", "Carol")).unwrap();
        students.add(Student::new("X00001111", "Alice")).unwrap();
        students.add(Student::new("X00002222", "Bob")).unwrap();
    }
    session.commit().await.unwrap();

    let mut students = session.set::<Student>().unwrap();
    let by_name = students
        .to_list(&Query::new().order_by("name", true))
        .await
        .unwrap();
    let names: Vec<_> = by_name.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Bob", "Carol"]);

    let page = students
        .fetch(&Query::new().order_by("name", false).offset(1).limit(1))
        .await
        .unwrap();
    assert_eq!(students.get(&page[0]).unwrap().name, "Bob");

    let again = students
        .query(Predicate::eq("name", "Bob"), &[])
        .await
        .unwrap();
    assert_eq!(again, page);
    assert_eq!(students.local().len(), 3);

    let fetches = backend.operation_count(StorageOp::Fetch);
    let bob_key = students.key(&page[0]).unwrap().unwrap();
    assert_eq!(students.find(bob_key).await.unwrap(), Some(page[0]));
    assert_eq!(backend.operation_count(StorageOp::Fetch), fetches);
}

#[tokio::test]
async fn test_unsupported_query_never_reaches_storage() {
    let (backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let mut students = session.set::<Student>().unwrap();
    let result = students
        .query(Predicate::eq("shoe_size", 42), &[OrderBy::asc("name")])
        .await;
    assert!(matches!(result, Err(OrmError::UnsupportedQuery(_))));
    assert_eq!(backend.operation_count(StorageOp::Fetch), 0);
}

#[tokio::test]
async fn test_lazy_reference_is_cached_per_session() {
    let (backend, db) = memory_db().await;
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
    session.commit().await.unwrap();
    let gc_id = session.entity(&gc).unwrap().id;
    session
        .set::<Module>()
        .unwrap()
        .add(Module {
            id: None,
            name: Some("Databases".to_string()),
            credits: 5,
            lecturer_id: gc_id,
        })
        .unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();

    let mut session = db.open_session().await.unwrap();
    let module = session
        .set::<Module>()
        .unwrap()
        .query(Predicate::True, &[])
        .await
        .unwrap()[0];
    let before = backend.operation_count(StorageOp::Fetch);
    let first = session
        .load_reference::<Lecturer, _>(&module, "lecturer")
        .await
        .unwrap();
    assert_eq!(backend.operation_count(StorageOp::Fetch), before + 1);
    let second = session
        .load_reference::<Lecturer, _>(&module, "lecturer")
        .await
        .unwrap();
    assert_eq!(backend.operation_count(StorageOp::Fetch), before + 1);
    assert_eq!(first, second);

    let wrong = session
        .load_reference::<Lecturer, _>(&module, "teacher")
        .await;
    assert!(matches!(wrong, Err(OrmError::UnknownNavigation { .. })));
}

#[tokio::test]
async fn test_collection_includes_unsaved_dependents() {
    let (_backend, db) = memory_db().await;
    let mut session = db.open_session().await.unwrap();
    let student = session
        .set::<Student>()
        .unwrap()
        .add(Student::new("X00001111", "Alice"))
        .unwrap();
    let mut enrolments = Vec::new();
    for course in ["Databases", "Networks"] {
        let mut set = session.set::<Enrolment>().unwrap();
        let enrolment = set
            .add(Enrolment {
                id: None,
                student_id: None,
                course: course.to_string(),
            })
            .unwrap();
        set.set_reference(&enrolment, "student", Some(&student)).unwrap();
        enrolments.push(enrolment);
    }

    let linked = session
        .load_collection::<Enrolment, _>(&student, "enrolments")
        .await
        .unwrap();
    assert_eq!(linked, enrolments);
    assert_eq!(
        session
            .load_reference::<Student, _>(&enrolments[0], "student")
            .await
            .unwrap(),
        Some(student)
    );

    session.commit().await.unwrap();
    session.set::<Enrolment>().unwrap().remove(&enrolments[1]).unwrap();
    let remaining = session
        .load_collection::<Enrolment, _>(&student, "enrolments")
        .await
        .unwrap();
    assert_eq!(remaining, vec![enrolments[0]]);
}

async fn staff_db() -> (MemoryBackend, Database) {
    let backend = MemoryBackend::new();
    let db = Database::with_backend(Arc::new(backend.clone()), staff_registry());
    db.synchronize(SyncPolicy::CreateIfAbsent).await.unwrap();
    (backend, db)
}

#[tokio::test]
async fn test_self_reference_to_later_added_principal() {
    let (backend, db) = staff_db().await;
    let mut session = db.open_session().await.unwrap();
    let (worker, boss) = {
        let mut staff = session.set::<Employee>().unwrap();
        let worker = staff.add(Employee::new("Worker")).unwrap();
        let boss = staff.add(Employee::new("Boss")).unwrap();
        staff.set_reference(&worker, "manager", Some(&boss)).unwrap();
        (worker, boss)
    };
    assert_eq!(session.commit().await.unwrap(), 2);
    // the boss is inserted first, so no follow-up write is needed
    assert_eq!(backend.operation_count(StorageOp::Update), 0);

    let boss_id = session.entity(&boss).unwrap().id;
    let worker = session.entity(&worker).unwrap();
    assert!(boss_id.is_some());
    assert_eq!(worker.manager_id, boss_id);
    session.close().await.unwrap();

    let mut check = db.open_session().await.unwrap();
    let stored = check
        .set::<Employee>()
        .unwrap()
        .find(worker.id.unwrap())
        .await
        .unwrap()
        .expect("worker is stored");
    assert_eq!(check.entity(&stored).unwrap().manager_id, boss_id);
}

#[tokio::test]
async fn test_cyclic_optional_links_written_after_insert() {
    let (backend, db) = staff_db().await;
    common::manager_cycle_scenario(&db).await;
    // Ann and Cy each need one relink write
    assert_eq!(backend.operation_count(StorageOp::Update), 2);
    assert_eq!(backend.operation_count(StorageOp::Insert), 3);
}

#[tokio::test]
async fn test_failed_relink_rolls_back_inserts() {
    let (backend, db) = staff_db().await;
    let mut session = db.open_session().await.unwrap();
    let cy = {
        let mut staff = session.set::<Employee>().unwrap();
        let cy = staff.add(Employee::new("Cy")).unwrap();
        staff.set_reference(&cy, "manager", Some(&cy)).unwrap();
        cy
    };
    backend.fail_after(StorageOp::Update, 0);
    assert!(matches!(session.commit().await, Err(OrmError::CommitFailed(_))));
    assert_eq!(session.state(&cy), EntityState::Added);
    assert_eq!(backend.row_count("employees"), 0);

    assert_eq!(session.commit().await.unwrap(), 1);
    let cy = session.entity(&cy).unwrap();
    assert_eq!(cy.manager_id, cy.id);
}
