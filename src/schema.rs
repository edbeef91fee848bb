//! Entity definitions and the schema registry.
//!
//! Descriptors are built once, validated on registration, and never mutated
//! afterwards. Relationships are declared explicitly on the dependent entity;
//! no foreign key is ever guessed from field names.
//!
//! Usage:
//! let lecturer = EntityDescriptor::builder("Lecturer")
//!     .identity_key("id")
//!     .nullable("name", FieldType::Text)
//!     .build();
//! let mut registry = SchemaRegistry::new();
//! registry.register(lecturer)?;
//! let registry = registry.seal()?;

use log::{debug, info};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{OrmError, Result};
use crate::value::{FieldType, Row, Value};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Whether `name` can be used unquoted as a table or column name.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

/// A one-to-many relationship, declared on the dependent side.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDescriptor {
    pub principal: String,
    pub dependent: String,
    /// Foreign-key field on the dependent.
    pub foreign_key: String,
    /// A nullable foreign key makes the relationship optional; a required one
    /// cascades deletes from the principal.
    pub optional: bool,
    /// Navigation from a dependent to its principal, e.g. `lecturer`.
    pub reference: String,
    /// Navigation from a principal to its dependents, e.g. `modules`.
    pub collection: String,
    /// Principal table and key column, resolved when the registry is sealed.
    pub principal_table: String,
    pub principal_key: String,
}

impl RelationshipDescriptor {
    pub fn required(&self) -> bool {
        !self.optional
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldDescriptor>,
    pub primary_key: String,
    /// The store assigns the key on insert.
    pub identity: bool,
    pub relationships: Vec<RelationshipDescriptor>,
}

impl EntityDescriptor {
    pub fn builder(name: &str) -> EntityBuilder {
        EntityBuilder::new(name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn key_index(&self) -> usize {
        self.field_index(&self.primary_key).unwrap_or(0)
    }

    pub fn key_field(&self) -> &FieldDescriptor {
        &self.fields[self.key_index()]
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Relationship whose reference navigation (dependent → principal) is `navigation`.
    pub fn reference(&self, navigation: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.reference == navigation)
    }

    /// Serialize an entity into a row in field order.
    pub fn to_row<T: Serialize>(&self, entity: &T) -> Result<Row> {
        let json = serde_json::to_value(entity)?;
        let object = match json {
            serde_json::Value::Object(map) => map,
            _ => {
                return Err(OrmError::InvalidValue {
                    entity: self.name.clone(),
                    field: String::new(),
                    reason: "entity does not serialize to an object".to_string(),
                });
            }
        };
        let mut row = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let raw = object.get(&field.name).unwrap_or(&serde_json::Value::Null);
            let value = Value::from_json(raw, field.field_type).ok_or_else(|| {
                OrmError::InvalidValue {
                    entity: self.name.clone(),
                    field: field.name.clone(),
                    reason: format!("expected {}, found `{}`", field.field_type.sql_type(), raw),
                }
            })?;
            row.push(value);
        }
        Ok(row)
    }

    /// Rebuild an entity from a row in field order.
    pub fn from_row<T: DeserializeOwned>(&self, row: &Row) -> Result<T> {
        let mut object = serde_json::Map::with_capacity(self.fields.len());
        for (field, value) in self.fields.iter().zip(row.iter()) {
            object.insert(field.name.clone(), value.to_json());
        }
        Ok(serde_json::from_value(serde_json::Value::Object(object))?)
    }

    /// Verify types and nullability of a row. The identity key may be null,
    /// as may the fields listed in `deferred`, which are filled in on commit.
    pub fn check_row(&self, row: &Row, deferred: &[usize]) -> Result<()> {
        let key_index = self.key_index();
        if row.len() != self.fields.len() {
            return Err(OrmError::InvalidValue {
                entity: self.name.clone(),
                field: String::new(),
                reason: format!("expected {} values, found {}", self.fields.len(), row.len()),
            });
        }
        for (index, (field, value)) in self.fields.iter().zip(row.iter()).enumerate() {
            if !value.fits(field.field_type) {
                return Err(OrmError::InvalidValue {
                    entity: self.name.clone(),
                    field: field.name.clone(),
                    reason: format!("expected {}, found {}", field.field_type.sql_type(), value),
                });
            }
            let pending = (index == key_index && self.identity) || deferred.contains(&index);
            if value.is_null() && !field.nullable && !pending {
                return Err(OrmError::InvalidValue {
                    entity: self.name.clone(),
                    field: field.name.clone(),
                    reason: "value is required".to_string(),
                });
            }
        }
        Ok(())
    }

    fn canonical(&self) -> String {
        let mut out = format!("{}:{}:{}:{}", self.name, self.table, self.primary_key, self.identity);
        for f in &self.fields {
            out.push_str(&format!("|{}:{}:{}", f.name, f.field_type.sql_type(), f.nullable));
        }
        for r in &self.relationships {
            out.push_str(&format!("|fk:{}->{}:{}", r.foreign_key, r.principal, r.optional));
        }
        out
    }
}

/// Fluent builder for [`EntityDescriptor`].
pub struct EntityBuilder {
    descriptor: EntityDescriptor,
}

impl EntityBuilder {
    fn new(name: &str) -> Self {
        EntityBuilder {
            descriptor: EntityDescriptor {
                name: name.to_string(),
                table: format!("{}s", name.to_lowercase()),
                fields: Vec::new(),
                primary_key: String::new(),
                identity: false,
                relationships: Vec::new(),
            },
        }
    }

    /// Override the default (lowercased, pluralised) table name.
    pub fn table(mut self, table: &str) -> Self {
        self.descriptor.table = table.to_string();
        self
    }

    /// An integer primary key assigned by the store.
    pub fn identity_key(mut self, name: &str) -> Self {
        self.descriptor.fields.push(FieldDescriptor {
            name: name.to_string(),
            field_type: FieldType::Integer,
            nullable: false,
        });
        self.descriptor.primary_key = name.to_string();
        self.descriptor.identity = true;
        self
    }

    /// A caller-assigned primary key.
    pub fn key(mut self, name: &str, field_type: FieldType) -> Self {
        self.descriptor.fields.push(FieldDescriptor {
            name: name.to_string(),
            field_type,
            nullable: false,
        });
        self.descriptor.primary_key = name.to_string();
        self.descriptor.identity = false;
        self
    }

    /// A NOT NULL field.
    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.descriptor.fields.push(FieldDescriptor {
            name: name.to_string(),
            field_type,
            nullable: false,
        });
        self
    }

    pub fn nullable(mut self, name: &str, field_type: FieldType) -> Self {
        self.descriptor.fields.push(FieldDescriptor {
            name: name.to_string(),
            field_type,
            nullable: true,
        });
        self
    }

    /// A non-nullable foreign key to `principal`; deletes cascade.
    pub fn required_fk(
        self,
        field: &str,
        field_type: FieldType,
        principal: &str,
        reference: &str,
        collection: &str,
    ) -> Self {
        self.relationship(field, field_type, principal, reference, collection, false)
    }

    /// A nullable foreign key to `principal`.
    pub fn optional_fk(
        self,
        field: &str,
        field_type: FieldType,
        principal: &str,
        reference: &str,
        collection: &str,
    ) -> Self {
        self.relationship(field, field_type, principal, reference, collection, true)
    }

    fn relationship(
        mut self,
        field: &str,
        field_type: FieldType,
        principal: &str,
        reference: &str,
        collection: &str,
        optional: bool,
    ) -> Self {
        self.descriptor.fields.push(FieldDescriptor {
            name: field.to_string(),
            field_type,
            nullable: optional,
        });
        self.descriptor.relationships.push(RelationshipDescriptor {
            principal: principal.to_string(),
            dependent: self.descriptor.name.clone(),
            foreign_key: field.to_string(),
            optional,
            reference: reference.to_string(),
            collection: collection.to_string(),
            principal_table: String::new(),
            principal_key: String::new(),
        });
        self
    }

    pub fn build(self) -> EntityDescriptor {
        self.descriptor
    }
}

/// A plain data type mapped to a table.
///
/// Field names of the serde representation must match the descriptor.
pub trait Entity: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;

    fn describe() -> EntityDescriptor;
}

/// Startup registration collected by [`SchemaRegistry::global`].
pub struct EntityRegistration(pub fn() -> EntityDescriptor);

inventory::collect!(EntityRegistration);

/// Entity definitions keyed by name, in registration order.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entities: Vec<Arc<EntityDescriptor>>,
    by_name: HashMap<String, usize>,
}

static GLOBAL: OnceCell<Arc<SchemaRegistry>> = OnceCell::new();

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry built from every `inventory`-submitted
    /// [`EntityRegistration`]. Built on first use, read-only afterwards.
    pub fn global() -> Result<Arc<SchemaRegistry>> {
        GLOBAL
            .get_or_try_init(|| {
                let mut registry = SchemaRegistry::new();
                let mut registrations: Vec<EntityDescriptor> =
                    inventory::iter::<EntityRegistration>
                        .into_iter()
                        .map(|r| (r.0)())
                        .collect();
                // inventory yields in link order; keep registration deterministic
                registrations.sort_by(|a, b| a.name.cmp(&b.name));
                for descriptor in registrations {
                    registry.register(descriptor)?;
                }
                registry.seal()
            })
            .cloned()
    }

    /// Register an entity type. Relationships are checked by [`seal`](Self::seal).
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<()> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(OrmError::DuplicateEntity(descriptor.name));
        }
        validate_descriptor(&descriptor)?;
        if self.entities.iter().any(|e| e.table == descriptor.table) {
            return Err(invalid(
                &descriptor,
                format!("table `{}` is already mapped", descriptor.table),
            ));
        }
        debug!(
            "Registered entity `{}` (table `{}`, {} fields)",
            descriptor.name,
            descriptor.table,
            descriptor.fields.len()
        );
        self.by_name.insert(descriptor.name.clone(), self.entities.len());
        self.entities.push(Arc::new(descriptor));
        Ok(())
    }

    pub fn register_entity<T: Entity>(&mut self) -> Result<()> {
        let descriptor = T::describe();
        if descriptor.name != T::NAME {
            return Err(invalid(
                &descriptor,
                format!("describe() names `{}`, expected `{}`", descriptor.name, T::NAME),
            ));
        }
        self.register(descriptor)
    }

    /// Check every relationship against the registered principals and freeze.
    pub fn seal(mut self) -> Result<Arc<SchemaRegistry>> {
        for i in 0..self.entities.len() {
            for j in 0..self.entities[i].relationships.len() {
                let entity = &self.entities[i];
                let rel = &entity.relationships[j];
                let principal = self.describe(&rel.principal)?;
                let fk = entity.field(&rel.foreign_key).ok_or_else(|| {
                    invalid(entity, format!("foreign key `{}` is not a field", rel.foreign_key))
                })?;
                let key = principal.key_field();
                if fk.field_type != key.field_type {
                    return Err(invalid(
                        entity,
                        format!(
                            "foreign key `{}` is {} but `{}.{}` is {}",
                            fk.name,
                            fk.field_type.sql_type(),
                            principal.name,
                            key.name,
                            key.field_type.sql_type()
                        ),
                    ));
                }
                if fk.nullable != rel.optional {
                    return Err(invalid(
                        entity,
                        format!("nullability of `{}` disagrees with the relationship", fk.name),
                    ));
                }
                let rel = &mut Arc::make_mut(&mut self.entities[i]).relationships[j];
                rel.principal_table = principal.table.clone();
                rel.principal_key = principal.primary_key.clone();
            }
        }
        info!(
            "Schema registry sealed with {} entities (fingerprint {})",
            self.entities.len(),
            self.fingerprint()
        );
        Ok(Arc::new(self))
    }

    pub fn describe(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
        self.by_name
            .get(name)
            .map(|&i| self.entities[i].clone())
            .ok_or_else(|| OrmError::UnknownEntity(name.to_string()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Relationships in which `principal` is the principal side.
    pub fn dependents_of(&self, principal: &str) -> Vec<&RelationshipDescriptor> {
        self.entities
            .iter()
            .flat_map(|e| e.relationships.iter())
            .filter(|r| r.principal == principal)
            .collect()
    }

    /// Relationship reachable from `entity` through `navigation`, in either
    /// direction. The flag is true when `entity` is the dependent.
    pub fn navigation(
        &self,
        entity: &str,
        navigation: &str,
    ) -> Result<(&RelationshipDescriptor, bool)> {
        let descriptor = self.by_name.get(entity).map(|&i| &self.entities[i]);
        if let Some(rel) = descriptor.and_then(|d| d.reference(navigation)) {
            return Ok((rel, true));
        }
        if let Some(rel) = self
            .dependents_of(entity)
            .into_iter()
            .find(|r| r.collection == navigation)
        {
            return Ok((rel, false));
        }
        Err(OrmError::UnknownNavigation {
            entity: entity.to_string(),
            navigation: navigation.to_string(),
        })
    }

    /// Order `names` so that principals precede their dependents.
    ///
    /// Every relationship between the named entities is honoured when
    /// possible. If that is cyclic, optional relationships are ignored; a
    /// cycle of required relationships fails with `CyclicDependency`.
    pub fn dependency_order(&self, names: &BTreeSet<String>) -> Result<Vec<String>> {
        match self.topological(names, true) {
            Ok(order) => Ok(order),
            Err(_) => self.topological(names, false),
        }
    }

    fn topological(&self, names: &BTreeSet<String>, include_optional: bool) -> Result<Vec<String>> {
        // principal -> dependents, restricted to `names`
        let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut indegree: BTreeMap<&str, usize> = names.iter().map(|n| (n.as_str(), 0)).collect();
        for name in names {
            let Some(&i) = self.by_name.get(name) else {
                return Err(OrmError::UnknownEntity(name.clone()));
            };
            for rel in &self.entities[i].relationships {
                if !names.contains(&rel.principal) || (rel.optional && !include_optional) {
                    continue;
                }
                if edges
                    .entry(rel.principal.as_str())
                    .or_default()
                    .insert(rel.dependent.as_str())
                {
                    *indegree.entry(rel.dependent.as_str()).or_default() += 1;
                }
            }
        }

        // Kahn's algorithm, ties broken by registration order
        let position = |n: &str| self.by_name.get(n).copied().unwrap_or(usize::MAX);
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(names.len());
        while !ready.is_empty() {
            ready.sort_by_key(|n| std::cmp::Reverse(position(n)));
            let Some(next) = ready.pop() else { break };
            order.push(next.to_string());
            if let Some(dependents) = edges.get(next) {
                for dep in dependents {
                    if let Some(d) = indegree.get_mut(dep) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(*dep);
                        }
                    }
                }
            }
        }

        if order.len() != names.len() {
            let cycle: Vec<String> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(OrmError::CyclicDependency(cycle));
        }
        Ok(order)
    }

    /// Hash of the declared schema, stable across runs.
    pub fn fingerprint(&self) -> String {
        let mut canon: Vec<String> = self.entities.iter().map(|e| e.canonical()).collect();
        canon.sort();
        let mut hasher = Sha256::new();
        for line in canon {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

fn invalid(descriptor: &EntityDescriptor, reason: String) -> OrmError {
    OrmError::InvalidDescriptor {
        entity: descriptor.name.clone(),
        reason,
    }
}

fn validate_descriptor(descriptor: &EntityDescriptor) -> Result<()> {
    for name in [&descriptor.name, &descriptor.table] {
        if !is_identifier(name) {
            return Err(invalid(descriptor, format!("`{}` is not a valid identifier", name)));
        }
    }
    let mut seen = BTreeSet::new();
    for field in &descriptor.fields {
        if !is_identifier(&field.name) {
            return Err(invalid(
                descriptor,
                format!("`{}` is not a valid identifier", field.name),
            ));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(invalid(descriptor, format!("field `{}` is declared twice", field.name)));
        }
    }
    let key = descriptor
        .field(&descriptor.primary_key)
        .ok_or_else(|| invalid(descriptor, "no primary key declared".to_string()))?;
    if key.nullable || !matches!(key.field_type, FieldType::Integer | FieldType::Text) {
        return Err(invalid(
            descriptor,
            "primary key must be a non-null integer or text field".to_string(),
        ));
    }
    if descriptor.identity && key.field_type != FieldType::Integer {
        return Err(invalid(descriptor, "identity keys must be integers".to_string()));
    }
    for rel in &descriptor.relationships {
        if rel.foreign_key == descriptor.primary_key {
            return Err(invalid(
                descriptor,
                "a foreign key cannot be the primary key".to_string(),
            ));
        }
        for nav in [&rel.reference, &rel.collection] {
            if !is_identifier(nav) {
                return Err(invalid(descriptor, format!("`{}` is not a valid navigation", nav)));
            }
        }
    }
    Ok(())
}
