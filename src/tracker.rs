//! Per-session record of loaded, added, modified and removed entities.
//!
//! The tracker owns every entity value handed to a session. Identity is by
//! (entity, primary key) once a key exists, and by entry id before that.
//! Nothing here talks to storage: [`ChangeTracker::pending_operations`]
//! describes the writes, and [`ChangeTracker::accept_changes`] records their
//! outcome once the store has committed them.

use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::{OrmError, Result};
use crate::schema::{EntityDescriptor, SchemaRegistry};
use crate::value::{KeyValue, Row, Value};

/// Identifies one tracked entity within a tracker.
pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Detached,
    Unchanged,
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityState::Detached => "detached",
            EntityState::Unchanged => "unchanged",
            EntityState::Added => "added",
            EntityState::Modified => "modified",
            EntityState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    /// Writes optional foreign keys that were left empty on insert because
    /// their principals formed a cycle with the inserted entry.
    Relink,
}

/// Lazily loaded navigation results for one entry.
#[derive(Debug, Clone, Default)]
pub(crate) struct NavigationCache {
    /// navigation -> (foreign key value it was resolved for, principal)
    pub(crate) references: HashMap<String, (Value, Option<EntryId>)>,
    /// collection navigations already fetched from storage
    pub(crate) collections: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct TrackedEntity {
    pub id: EntryId,
    pub descriptor: Arc<EntityDescriptor>,
    pub state: EntityState,
    pub values: Row,
    /// Values as last loaded from or written to storage.
    pub original: Row,
    /// Foreign-key field index -> principal entry whose key fills it on commit.
    pub links: BTreeMap<usize, EntryId>,
    pub(crate) navigation: NavigationCache,
}

impl TrackedEntity {
    pub fn entity(&self) -> &str {
        &self.descriptor.name
    }

    pub fn key(&self) -> Option<KeyValue> {
        self.values[self.descriptor.key_index()].as_key()
    }

    /// Indices of non-key fields whose value differs from the original.
    pub fn changed_fields(&self) -> Vec<usize> {
        let key_index = self.descriptor.key_index();
        self.values
            .iter()
            .zip(self.original.iter())
            .enumerate()
            .filter(|(i, (now, before))| *i != key_index && now != before)
            .map(|(i, _)| i)
            .collect()
    }
}

pub struct ChangeTracker {
    registry: Arc<SchemaRegistry>,
    entries: BTreeMap<EntryId, TrackedEntity>,
    identity: HashMap<(String, KeyValue), EntryId>,
    next_id: EntryId,
}

impl ChangeTracker {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        ChangeTracker {
            registry,
            entries: BTreeMap::new(),
            identity: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    fn track(&mut self, descriptor: Arc<EntityDescriptor>, values: Row, state: EntityState) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        let entry = TrackedEntity {
            id,
            descriptor,
            state,
            original: values.clone(),
            values,
            links: BTreeMap::new(),
            navigation: NavigationCache::default(),
        };
        if let Some(key) = entry.key() {
            self.identity.insert((entry.entity().to_string(), key), id);
        }
        debug!("Tracking `{}` entry {} as {}", entry.entity(), id, state);
        self.entries.insert(id, entry);
        id
    }

    fn ensure_untracked(&self, descriptor: &EntityDescriptor, values: &Row) -> Result<()> {
        if let Some(key) = values[descriptor.key_index()].as_key() {
            if self.identity.contains_key(&(descriptor.name.clone(), key.clone())) {
                return Err(OrmError::AlreadyTracked {
                    entity: descriptor.name.clone(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Track a new entity to be inserted on commit.
    pub fn add(&mut self, descriptor: Arc<EntityDescriptor>, values: Row) -> Result<EntryId> {
        descriptor.check_row(&values, &fk_indices(&descriptor))?;
        self.ensure_untracked(&descriptor, &values)?;
        Ok(self.track(descriptor, values, EntityState::Added))
    }

    /// Track an entity that already exists in storage, as Unchanged.
    pub fn attach(&mut self, descriptor: Arc<EntityDescriptor>, values: Row) -> Result<EntryId> {
        descriptor.check_row(&values, &[])?;
        if values[descriptor.key_index()].as_key().is_none() {
            return Err(OrmError::InvalidValue {
                entity: descriptor.name.clone(),
                field: descriptor.primary_key.clone(),
                reason: "an attached entity needs a key".to_string(),
            });
        }
        self.ensure_untracked(&descriptor, &values)?;
        Ok(self.track(descriptor, values, EntityState::Unchanged))
    }

    /// Track a row fetched from storage. An entity already tracked under the
    /// same key keeps its tracked values.
    pub fn attach_loaded(&mut self, descriptor: Arc<EntityDescriptor>, values: Row) -> EntryId {
        if let Some(key) = values[descriptor.key_index()].as_key() {
            if let Some(&id) = self.identity.get(&(descriptor.name.clone(), key)) {
                return id;
            }
        }
        self.track(descriptor, values, EntityState::Unchanged)
    }

    pub fn get(&self, id: EntryId) -> Option<&TrackedEntity> {
        self.entries.get(&id)
    }

    pub fn entry(&self, id: EntryId) -> Result<&TrackedEntity> {
        self.entries.get(&id).ok_or(OrmError::NotTracked)
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> Result<&mut TrackedEntity> {
        self.entries.get_mut(&id).ok_or(OrmError::NotTracked)
    }

    pub fn find(&self, entity: &str, key: &KeyValue) -> Option<EntryId> {
        self.identity.get(&(entity.to_string(), key.clone())).copied()
    }

    pub fn state(&self, id: EntryId) -> EntityState {
        self.entries
            .get(&id)
            .map(|e| e.state)
            .unwrap_or(EntityState::Detached)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop tracking everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.identity.clear();
    }

    /// Replace the values of a tracked entity. Unchanged entities whose values
    /// differ from the original become Modified.
    pub fn set_values(&mut self, id: EntryId, values: Row) -> Result<()> {
        let entry = self.entry_mut(id)?;
        match entry.state {
            EntityState::Deleted | EntityState::Detached => {
                return Err(OrmError::InvalidState {
                    entity: entry.entity().to_string(),
                    state: entry.state.to_string(),
                });
            }
            _ => {}
        }
        let descriptor = entry.descriptor.clone();
        let key_index = descriptor.key_index();
        if entry.state != EntityState::Added && values[key_index] != entry.values[key_index] {
            return Err(OrmError::InvalidValue {
                entity: descriptor.name.clone(),
                field: descriptor.primary_key.clone(),
                reason: "the key of a stored entity cannot change".to_string(),
            });
        }
        let deferred: Vec<usize> = if entry.state == EntityState::Added {
            fk_indices(&descriptor)
        } else {
            entry.links.keys().copied().collect()
        };
        descriptor.check_row(&values, &deferred)?;

        let old_key = entry.key();
        entry.values = values;
        // an explicitly written foreign key overrides a pending link
        let mut unlinked = Vec::new();
        for (&field, _) in entry.links.iter() {
            if !entry.values[field].is_null() {
                unlinked.push(field);
            }
        }
        for field in unlinked {
            entry.links.remove(&field);
        }
        if entry.state == EntityState::Unchanged && !entry.changed_fields().is_empty() {
            entry.state = EntityState::Modified;
        }
        let new_key = entry.key();
        if old_key != new_key {
            self.rekey(&descriptor.name, id, old_key, new_key)?;
        }
        Ok(())
    }

    fn rekey(
        &mut self,
        entity: &str,
        id: EntryId,
        old_key: Option<KeyValue>,
        new_key: Option<KeyValue>,
    ) -> Result<()> {
        if let Some(key) = &new_key {
            if self.identity.contains_key(&(entity.to_string(), key.clone())) {
                return Err(OrmError::AlreadyTracked {
                    entity: entity.to_string(),
                    key: key.to_string(),
                });
            }
        }
        if let Some(key) = old_key {
            self.identity.remove(&(entity.to_string(), key));
        }
        if let Some(key) = new_key {
            self.identity.insert((entity.to_string(), key), id);
        }
        Ok(())
    }

    /// Flag an Unchanged entity as Modified. No-op if already Modified.
    pub fn mark_modified(&mut self, id: EntryId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        match entry.state {
            EntityState::Unchanged => {
                entry.state = EntityState::Modified;
                Ok(())
            }
            EntityState::Modified => Ok(()),
            state => Err(OrmError::InvalidState {
                entity: entry.entity().to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// Added entities are detached; stored ones become Deleted. Tracked
    /// dependents follow their relationship: required ones are removed too,
    /// optional ones lose their foreign key.
    pub fn remove(&mut self, id: EntryId) -> Result<()> {
        let (state, entity, key) = {
            let entry = self.entry(id)?;
            (entry.state, entry.entity().to_string(), entry.key())
        };
        match state {
            EntityState::Deleted | EntityState::Detached => return Ok(()),
            EntityState::Added => {
                self.detach(id);
            }
            EntityState::Unchanged | EntityState::Modified => {
                if let Ok(entry) = self.entry_mut(id) {
                    entry.state = EntityState::Deleted;
                    entry.links.clear();
                }
                debug!("Marked `{}` entry {} as deleted", entity, id);
            }
        }
        self.cascade(id, &entity, key.as_ref())
    }

    fn detach(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.remove(&id) {
            if let Some(key) = entry.key() {
                self.identity.remove(&(entry.entity().to_string(), key));
            }
            debug!("Detached `{}` entry {}", entry.entity(), id);
        }
    }

    fn cascade(&mut self, principal: EntryId, entity: &str, key: Option<&KeyValue>) -> Result<()> {
        let relationships: Vec<_> = self
            .registry
            .dependents_of(entity)
            .into_iter()
            .cloned()
            .collect();
        for rel in relationships {
            let dependents: Vec<(EntryId, usize)> = self
                .entries
                .values()
                .filter(|e| e.entity() == rel.dependent && e.id != principal)
                .filter(|e| !matches!(e.state, EntityState::Deleted | EntityState::Detached))
                .filter_map(|e| {
                    let index = e.descriptor.field_index(&rel.foreign_key)?;
                    let by_key = key.is_some() && e.values[index].as_key().as_ref() == key;
                    let by_link = e.links.get(&index) == Some(&principal);
                    (by_key || by_link).then_some((e.id, index))
                })
                .collect();
            for (dependent, index) in dependents {
                if rel.optional {
                    let entry = self.entry_mut(dependent)?;
                    entry.links.remove(&index);
                    entry.values[index] = Value::Null;
                    if entry.state == EntityState::Unchanged && !entry.changed_fields().is_empty() {
                        entry.state = EntityState::Modified;
                    }
                } else {
                    self.remove(dependent)?;
                }
            }
        }
        Ok(())
    }

    /// Point a dependent's foreign key at a principal entry. If the principal
    /// has no key yet, the key is written into the dependent on commit.
    /// `None` clears the relationship.
    pub fn link(&mut self, dependent: EntryId, fk_index: usize, principal: Option<EntryId>) -> Result<()> {
        let principal_key = match principal {
            Some(p) => {
                let entry = self.entry(p)?;
                if entry.state == EntityState::Deleted {
                    return Err(OrmError::InvalidState {
                        entity: entry.entity().to_string(),
                        state: entry.state.to_string(),
                    });
                }
                entry.key()
            }
            None => None,
        };
        let entry = self.entry_mut(dependent)?;
        if matches!(entry.state, EntityState::Deleted | EntityState::Detached) {
            return Err(OrmError::InvalidState {
                entity: entry.entity().to_string(),
                state: entry.state.to_string(),
            });
        }
        if principal.is_none() && !entry.descriptor.fields[fk_index].nullable {
            return Err(OrmError::InvalidValue {
                entity: entry.entity().to_string(),
                field: entry.descriptor.fields[fk_index].name.clone(),
                reason: "a required relationship cannot be cleared".to_string(),
            });
        }
        match (principal, principal_key) {
            (Some(_), Some(key)) => {
                entry.links.remove(&fk_index);
                entry.values[fk_index] = key.to_value();
            }
            (Some(p), None) => {
                entry.links.insert(fk_index, p);
                entry.values[fk_index] = Value::Null;
            }
            (None, _) => {
                entry.links.remove(&fk_index);
                entry.values[fk_index] = Value::Null;
            }
        }
        entry.navigation.references.clear();
        let linked = !entry.links.is_empty();
        if entry.state == EntityState::Unchanged && (linked || !entry.changed_fields().is_empty()) {
            entry.state = EntityState::Modified;
        }
        Ok(())
    }

    /// Writes needed to bring storage in line with the tracked state:
    /// inserts with principals first, then relinks, then updates, then
    /// deletes with dependents first.
    pub fn pending_operations(&self) -> Result<Vec<(&TrackedEntity, OperationKind)>> {
        let added: Vec<&TrackedEntity> = self.in_state(EntityState::Added);
        let modified: Vec<&TrackedEntity> = self.in_state(EntityState::Modified);
        let deleted: Vec<&TrackedEntity> = self.in_state(EntityState::Deleted);

        let mut ops = Vec::with_capacity(added.len() + modified.len() + deleted.len());
        let (inserts, relinks) = self.insert_order(added)?;
        for entry in inserts {
            ops.push((entry, OperationKind::Insert));
        }
        for entry in relinks {
            ops.push((entry, OperationKind::Relink));
        }
        for entry in modified {
            ops.push((entry, OperationKind::Update));
        }
        for entry in self.dependency_sorted(deleted, true)? {
            ops.push((entry, OperationKind::Delete));
        }
        Ok(ops)
    }

    fn in_state(&self, state: EntityState) -> Vec<&TrackedEntity> {
        self.entries.values().filter(|e| e.state == state).collect()
    }

    fn dependency_sorted<'a>(
        &self,
        mut entries: Vec<&'a TrackedEntity>,
        reverse: bool,
    ) -> Result<Vec<&'a TrackedEntity>> {
        if entries.is_empty() {
            return Ok(entries);
        }
        let names: BTreeSet<String> = entries.iter().map(|e| e.entity().to_string()).collect();
        let order = self.registry.dependency_order(&names)?;
        let rank: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), if reverse { order.len() - i } else { i }))
            .collect();
        entries.sort_by_key(|e| (rank.get(e.entity()).copied().unwrap_or(usize::MAX), e.id));
        Ok(entries)
    }

    /// Added entries in insert order. An entry follows every Added principal
    /// it is linked to. When links form a cycle, the first entry whose
    /// waiting links are all optional is inserted without them and returned
    /// again in the second list, to be relinked once its principals exist.
    fn insert_order<'a>(
        &self,
        added: Vec<&'a TrackedEntity>,
    ) -> Result<(Vec<&'a TrackedEntity>, Vec<&'a TrackedEntity>)> {
        let mut pending = self.dependency_sorted(added, false)?;
        let mut ordered = Vec::with_capacity(pending.len());
        let mut relinks = Vec::new();
        while !pending.is_empty() {
            let next = match pending.iter().position(|e| waiting_links(&pending, e).is_empty()) {
                Some(i) => i,
                None => {
                    let Some(i) = pending.iter().position(|e| {
                        waiting_links(&pending, e)
                            .iter()
                            .all(|&field| e.descriptor.fields[field].nullable)
                    }) else {
                        let members: BTreeSet<String> =
                            pending.iter().map(|e| e.entity().to_string()).collect();
                        return Err(OrmError::CyclicDependency(members.into_iter().collect()));
                    };
                    debug!(
                        "Linked `{}` entry {} is part of a cycle; its foreign keys are written after insert",
                        pending[i].entity(),
                        pending[i].id
                    );
                    relinks.push(pending[i]);
                    i
                }
            };
            ordered.push(pending.remove(next));
        }
        Ok((ordered, relinks))
    }

    /// Values to write for an entry, with linked foreign keys filled from
    /// keys assigned earlier in the same commit.
    ///
    /// A link whose principal has no key yet is an error, unless `defer` is
    /// set and the field is nullable; it is then left empty for a later
    /// relink.
    pub fn resolve_row(
        &self,
        id: EntryId,
        assigned: &HashMap<EntryId, Value>,
        defer: bool,
    ) -> Result<Row> {
        let entry = self.entry(id)?;
        let mut row = entry.values.clone();
        for (&field, principal) in &entry.links {
            let key = match assigned.get(principal) {
                Some(key) => Some(key.clone()),
                None => self.entry(*principal)?.key().map(|k| k.to_value()),
            };
            row[field] = match key {
                Some(key) => key,
                None if defer && entry.descriptor.fields[field].nullable => Value::Null,
                None => {
                    return Err(OrmError::InvalidValue {
                        entity: entry.entity().to_string(),
                        field: entry.descriptor.fields[field].name.clone(),
                        reason: "the linked principal has not been written yet".to_string(),
                    });
                }
            };
        }
        Ok(row)
    }

    /// Check every pending insert and update before anything is written.
    pub fn validate_pending(&self) -> Result<()> {
        for entry in self.entries.values() {
            if matches!(entry.state, EntityState::Added | EntityState::Modified) {
                let deferred: Vec<usize> = entry.links.keys().copied().collect();
                entry.descriptor.check_row(&entry.values, &deferred)?;
            }
        }
        Ok(())
    }

    /// Record a successful commit: inserted and updated entries become
    /// Unchanged with the written rows, deleted entries are dropped.
    pub fn accept_changes(&mut self, written: HashMap<EntryId, Row>) {
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            match entry.state {
                EntityState::Deleted => self.detach(id),
                EntityState::Added | EntityState::Modified => {
                    let old_key = entry.key();
                    if let Some(row) = written.get(&id) {
                        entry.values = row.clone();
                    }
                    entry.original = entry.values.clone();
                    entry.links.clear();
                    entry.state = EntityState::Unchanged;
                    let new_key = entry.key();
                    let entity = entry.entity().to_string();
                    if old_key != new_key {
                        if let Some(key) = old_key {
                            self.identity.remove(&(entity.clone(), key));
                        }
                        if let Some(key) = new_key {
                            self.identity.insert((entity, key), id);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Foreign-key fields of `entry` linked to an entry still in `pending`.
fn waiting_links(pending: &[&TrackedEntity], entry: &TrackedEntity) -> Vec<usize> {
    entry
        .links
        .iter()
        .filter(|(_, principal)| pending.iter().any(|p| p.id == **principal))
        .map(|(&field, _)| field)
        .collect()
}

fn fk_indices(descriptor: &EntityDescriptor) -> Vec<usize> {
    descriptor
        .relationships
        .iter()
        .filter_map(|r| descriptor.field_index(&r.foreign_key))
        .collect()
}
