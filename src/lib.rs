pub mod error;
pub mod orm;
pub mod query;
pub mod schema;
pub mod session;
pub mod settings;
pub mod storage;
pub mod sync;
pub mod tracker;
pub mod value;

pub use error::{OrmError, Result, SchemaDifference, StorageError, StorageErrorKind};
pub use orm::Database;
pub use query::{CompareOp, FetchPlan, OrderBy, Predicate, Query, QueryTranslator};
pub use schema::{
    Entity, EntityDescriptor, EntityRegistration, FieldDescriptor, RelationshipDescriptor,
    SchemaRegistry,
};
pub use session::{EntitySet, Session, Tracked};
pub use settings::{DatabaseSettings, Settings};
pub use sync::{SchemaSynchronizer, SyncPolicy, SyncReport};
pub use tracker::{ChangeTracker, EntityState, OperationKind};
pub use value::{FieldType, KeyValue, Value};

pub use inventory;
