//! Unit of work: one connection, one change tracker, one atomic commit.
//!
//! Usage:
//! let mut session = db.open_session().await?;
//! let mut lecturers = session.set::<Lecturer>()?;
//! let gc = lecturers.add(Lecturer { id: None, name: Some("GC".into()), phone: None })?;
//! session.commit().await?;
//! session.close().await?;

use log::{debug, error, info};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{OrmError, Result, StorageError};
use crate::query::{FetchPlan, OrderBy, Predicate, Query, QueryTranslator};
use crate::schema::{Entity, EntityDescriptor, SchemaRegistry};
use crate::storage::{StorageBackend, StorageConnection};
use crate::tracker::{ChangeTracker, EntityState, EntryId, OperationKind, TrackedEntity};
use crate::value::{KeyValue, Row, Value};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Typed handle to an entity tracked by one session.
pub struct Tracked<T> {
    session: u64,
    entry: EntryId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Tracked<T> {
    pub fn entry_id(&self) -> EntryId {
        self.entry
    }
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Tracked<T> {}

impl<T> PartialEq for Tracked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.session == other.session && self.entry == other.entry
    }
}

impl<T> Eq for Tracked<T> {}

impl<T> Hash for Tracked<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session.hash(state);
        self.entry.hash(state);
    }
}

impl<T> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tracked(session {}, entry {})", self.session, self.entry)
    }
}

pub struct Session {
    id: u64,
    registry: Arc<SchemaRegistry>,
    translator: QueryTranslator,
    tracker: ChangeTracker,
    conn: Option<Box<dyn StorageConnection>>,
}

impl Session {
    /// Acquire one connection from `backend`.
    pub async fn open(backend: &dyn StorageBackend, registry: Arc<SchemaRegistry>) -> Result<Session> {
        let conn = backend.connect().await.map_err(|e| {
            error!("Could not open a {} connection: {}", backend.name(), e);
            OrmError::ConnectionError(e)
        })?;
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        info!("Opened session {} on {} storage", id, backend.name());
        Ok(Session {
            id,
            translator: QueryTranslator::new(registry.clone()),
            tracker: ChangeTracker::new(registry.clone()),
            registry,
            conn: Some(conn),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn translator(&self) -> &QueryTranslator {
        &self.translator
    }

    /// Typed access to the entities of `T`.
    pub fn set<T: Entity>(&mut self) -> Result<EntitySet<'_, T>> {
        let descriptor = self.registry.describe(T::NAME)?;
        Ok(EntitySet {
            session: self,
            descriptor,
            _marker: PhantomData,
        })
    }

    /// Whether a commit would write anything.
    pub fn has_changes(&self) -> bool {
        self.tracker.entries().any(|e| {
            matches!(
                e.state,
                EntityState::Added | EntityState::Modified | EntityState::Deleted
            )
        })
    }

    fn handle<T>(&self, entry: EntryId) -> Tracked<T> {
        Tracked {
            session: self.id,
            entry,
            _marker: PhantomData,
        }
    }

    fn entry_of<T: Entity>(&self, handle: &Tracked<T>) -> Result<&TrackedEntity> {
        if handle.session != self.id {
            return Err(OrmError::NotTracked);
        }
        let entry = self.tracker.entry(handle.entry)?;
        if entry.entity() != T::NAME {
            return Err(OrmError::NotTracked);
        }
        Ok(entry)
    }

    /// Current tracked value of an entity.
    pub fn entity<T: Entity>(&self, handle: &Tracked<T>) -> Result<T> {
        let entry = self.entry_of(handle)?;
        entry.descriptor.from_row(&entry.values)
    }

    pub fn state<T: Entity>(&self, handle: &Tracked<T>) -> EntityState {
        self.entry_of(handle)
            .map(|e| e.state)
            .unwrap_or(EntityState::Detached)
    }

    fn connection(&mut self) -> Result<&mut dyn StorageConnection> {
        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(OrmError::DetachedAccess),
        }
    }

    /// Run a plan and track every returned row.
    async fn fetch_entries(&mut self, plan: &FetchPlan) -> Result<Vec<EntryId>> {
        let rows = self.connection()?.fetch(plan).await?;
        let descriptor = self.registry.describe(&plan.entity)?;
        Ok(rows
            .into_iter()
            .map(|row| self.tracker.attach_loaded(descriptor.clone(), row))
            .collect())
    }

    /// Write every pending change inside one transaction.
    ///
    /// Returns the number of entities written. On failure the transaction is
    /// rolled back, the tracker is left as it was, and `CommitFailed` carries
    /// the storage cause.
    pub async fn commit(&mut self) -> Result<usize> {
        if self.conn.is_none() {
            return Err(OrmError::DetachedAccess);
        }
        self.tracker.validate_pending()?;
        let ops: Vec<(EntryId, OperationKind)> = self
            .tracker
            .pending_operations()?
            .into_iter()
            .map(|(entry, kind)| (entry.id, kind))
            .collect();
        if ops.is_empty() {
            debug!("Session {}: nothing to commit", self.id);
            return Ok(0);
        }

        let Some(conn) = self.conn.as_deref_mut() else {
            return Err(OrmError::DetachedAccess);
        };
        if let Err(e) = conn.begin().await {
            error!("Session {}: could not begin transaction: {}", self.id, e);
            return Err(OrmError::CommitFailed(e));
        }
        let outcome = match apply_operations(conn, &self.tracker, &ops).await {
            Ok(written) => conn.commit().await.map(|_| written),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(written) => {
                let count = |k: OperationKind| ops.iter().filter(|(_, kind)| *kind == k).count();
                let changes = ops.len() - count(OperationKind::Relink);
                info!(
                    "Session {} committed {} changes ({} inserts, {} updates, {} deletes)",
                    self.id,
                    changes,
                    count(OperationKind::Insert),
                    count(OperationKind::Update),
                    count(OperationKind::Delete)
                );
                self.tracker.accept_changes(written);
                Ok(changes)
            }
            Err(cause) => {
                error!("Session {}: commit failed: {}", self.id, cause);
                let rolled_back = conn.rollback().await;
                if let Err(e) = rolled_back {
                    // a connection in an unknown transaction state is not reused
                    error!("Session {}: rollback failed, discarding connection: {}", self.id, e);
                    self.conn = None;
                }
                Err(OrmError::CommitFailed(cause))
            }
        }
    }

    /// Release the connection. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await?;
            info!("Closed session {}", self.id);
        }
        Ok(())
    }

    /// Resolve a dependent's reference navigation (e.g. module → lecturer),
    /// fetching the principal on first access. The result is cached for the
    /// lifetime of the session while the foreign key is unchanged.
    pub async fn load_reference<P: Entity, D: Entity>(
        &mut self,
        dependent: &Tracked<D>,
        navigation: &str,
    ) -> Result<Option<Tracked<P>>> {
        if self.conn.is_none() {
            return Err(OrmError::DetachedAccess);
        }
        let registry = self.registry.clone();
        let (rel, is_dependent) = registry.navigation(D::NAME, navigation)?;
        if !is_dependent || rel.principal != P::NAME {
            return Err(unknown_navigation(D::NAME, navigation));
        }

        let entry = self.entry_of(dependent)?;
        let fk_index = entry
            .descriptor
            .field_index(&rel.foreign_key)
            .ok_or_else(|| unknown_navigation(D::NAME, navigation))?;
        if let Some(&principal) = entry.links.get(&fk_index) {
            return Ok(Some(self.handle(principal)));
        }
        let fk = entry.values[fk_index].clone();
        if let Some((cached_fk, cached)) = entry.navigation.references.get(navigation) {
            let live = cached.is_none_or(|id| self.tracker.get(id).is_some());
            if *cached_fk == fk && live {
                debug!("Navigation `{}.{}` served from cache", D::NAME, navigation);
                return Ok(cached.map(|id| self.handle(id)));
            }
        }

        let principal = match fk.as_key() {
            None => None,
            Some(key) => match self.tracker.find(P::NAME, &key) {
                Some(id) => Some(id),
                None => {
                    let plan = self.translator.translate(
                        P::NAME,
                        &Predicate::eq(&rel.principal_key, key.to_value()),
                        &[],
                    )?;
                    self.fetch_entries(&plan).await?.into_iter().next()
                }
            },
        };
        self.tracker
            .entry_mut(dependent.entry)?
            .navigation
            .references
            .insert(navigation.to_string(), (fk, principal));
        Ok(principal.map(|id| self.handle(id)))
    }

    /// Resolve a principal's collection navigation (e.g. lecturer → modules).
    /// Storage is queried once per session; afterwards the tracked entities
    /// are authoritative. Deleted dependents are excluded.
    pub async fn load_collection<D: Entity, P: Entity>(
        &mut self,
        principal: &Tracked<P>,
        navigation: &str,
    ) -> Result<Vec<Tracked<D>>> {
        if self.conn.is_none() {
            return Err(OrmError::DetachedAccess);
        }
        let registry = self.registry.clone();
        let (rel, is_dependent) = registry.navigation(P::NAME, navigation)?;
        if is_dependent || rel.dependent != D::NAME {
            return Err(unknown_navigation(P::NAME, navigation));
        }
        let dependent = registry.describe(D::NAME)?;
        let fk_index = dependent
            .field_index(&rel.foreign_key)
            .ok_or_else(|| unknown_navigation(P::NAME, navigation))?;

        let entry = self.entry_of(principal)?;
        let key = entry.key();
        let stored = entry.state != EntityState::Added;
        let loaded = entry.navigation.collections.contains(navigation);
        if let Some(key) = &key {
            if stored && !loaded {
                let plan = self.translator.translate(
                    D::NAME,
                    &Predicate::eq(&rel.foreign_key, key.to_value()),
                    &[],
                )?;
                self.fetch_entries(&plan).await?;
                self.tracker
                    .entry_mut(principal.entry)?
                    .navigation
                    .collections
                    .insert(navigation.to_string());
            }
        }

        let mut members: Vec<(Option<KeyValue>, EntryId)> = self
            .tracker
            .entries()
            .filter(|e| e.entity() == D::NAME && e.state != EntityState::Deleted)
            .filter(|e| {
                let by_link = e.links.get(&fk_index) == Some(&principal.entry);
                let by_key = key.is_some() && e.values[fk_index].as_key() == key;
                by_link || by_key
            })
            .map(|e| (e.key(), e.id))
            .collect();
        members.sort_by(|a, b| (a.0.is_none(), &a.0, a.1).cmp(&(b.0.is_none(), &b.0, b.1)));
        Ok(members.into_iter().map(|(_, id)| self.handle(id)).collect())
    }
}

fn unknown_navigation(entity: &str, navigation: &str) -> OrmError {
    OrmError::UnknownNavigation {
        entity: entity.to_string(),
        navigation: navigation.to_string(),
    }
}

/// Execute `ops` in order. Keys generated by inserts are fed into the
/// foreign keys of later rows. Returns the row written for each entry.
async fn apply_operations(
    conn: &mut dyn StorageConnection,
    tracker: &ChangeTracker,
    ops: &[(EntryId, OperationKind)],
) -> std::result::Result<HashMap<EntryId, Row>, StorageError> {
    let internal = |e: OrmError| StorageError::internal(e.to_string());
    let mut assigned: HashMap<EntryId, Value> = HashMap::new();
    let mut written: HashMap<EntryId, Row> = HashMap::new();
    let relinked: HashSet<EntryId> = ops
        .iter()
        .filter(|(_, kind)| *kind == OperationKind::Relink)
        .map(|(id, _)| *id)
        .collect();

    for &(id, kind) in ops {
        let entry = tracker.entry(id).map_err(internal)?;
        let descriptor: Arc<EntityDescriptor> = entry.descriptor.clone();
        let key_index = descriptor.key_index();
        let defer = kind == OperationKind::Insert && relinked.contains(&id);
        let mut row = tracker.resolve_row(id, &assigned, defer).map_err(internal)?;
        match kind {
            OperationKind::Insert => {
                let key = conn.insert(&descriptor, &row).await?;
                debug!("Inserted `{}` with key {}", descriptor.name, key);
                row[key_index] = key.clone();
                assigned.insert(id, key);
                written.insert(id, row);
            }
            OperationKind::Update => {
                let key = entry.original[key_index].clone();
                let mut fields: Vec<(String, Value)> = row
                    .iter()
                    .zip(entry.original.iter())
                    .enumerate()
                    .filter(|(i, (now, before))| *i != key_index && now != before)
                    .map(|(i, (now, _))| (descriptor.fields[i].name.clone(), now.clone()))
                    .collect();
                if fields.is_empty() {
                    // marked modified without a detectable change: write it all
                    fields = row
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != key_index)
                        .map(|(i, v)| (descriptor.fields[i].name.clone(), v.clone()))
                        .collect();
                }
                let affected = conn.update(&descriptor, &key, &fields).await?;
                if affected == 0 && !fields.is_empty() {
                    return Err(StorageError::constraint(format!(
                        "`{}` with key {} no longer exists",
                        descriptor.name, key
                    )));
                }
                written.insert(id, row);
            }
            OperationKind::Relink => {
                let key = assigned
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| entry.values[key_index].clone());
                let fields: Vec<(String, Value)> = entry
                    .links
                    .keys()
                    .map(|&i| (descriptor.fields[i].name.clone(), row[i].clone()))
                    .collect();
                let affected = conn.update(&descriptor, &key, &fields).await?;
                if affected == 0 {
                    return Err(StorageError::constraint(format!(
                        "`{}` with key {} was not inserted",
                        descriptor.name, key
                    )));
                }
                debug!("Relinked `{}` with key {}", descriptor.name, key);
                if let Some(inserted) = written.get_mut(&id) {
                    for &i in entry.links.keys() {
                        inserted[i] = row[i].clone();
                    }
                }
            }
            OperationKind::Delete => {
                let key = entry.original[key_index].clone();
                let affected = conn.delete(&descriptor, &key).await?;
                if affected == 0 {
                    return Err(StorageError::constraint(format!(
                        "`{}` with key {} no longer exists",
                        descriptor.name, key
                    )));
                }
            }
        }
    }
    Ok(written)
}

/// Typed view over one entity set of a session.
pub struct EntitySet<'s, T: Entity> {
    session: &'s mut Session,
    descriptor: Arc<EntityDescriptor>,
    _marker: PhantomData<fn() -> T>,
}

impl<'s, T: Entity> EntitySet<'s, T> {
    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// Track a new entity; it is inserted on commit.
    pub fn add(&mut self, entity: T) -> Result<Tracked<T>> {
        let row = self.descriptor.to_row(&entity)?;
        let id = self.session.tracker.add(self.descriptor.clone(), row)?;
        Ok(self.session.handle(id))
    }

    /// Track an entity known to exist in storage, as Unchanged.
    pub fn attach(&mut self, entity: T) -> Result<Tracked<T>> {
        let row = self.descriptor.to_row(&entity)?;
        let id = self.session.tracker.attach(self.descriptor.clone(), row)?;
        Ok(self.session.handle(id))
    }

    /// Delete on commit; an entity that was only added is simply forgotten.
    pub fn remove(&mut self, handle: &Tracked<T>) -> Result<()> {
        self.session.entry_of(handle)?;
        self.session.tracker.remove(handle.entry)
    }

    pub fn get(&self, handle: &Tracked<T>) -> Result<T> {
        self.session.entity(handle)
    }

    /// Primary key, once known.
    pub fn key(&self, handle: &Tracked<T>) -> Result<Option<KeyValue>> {
        Ok(self.session.entry_of(handle)?.key())
    }

    pub fn state(&self, handle: &Tracked<T>) -> EntityState {
        self.session.state(handle)
    }

    /// Mutate a tracked entity in place; detected changes mark it Modified.
    pub fn update<F: FnOnce(&mut T)>(&mut self, handle: &Tracked<T>, f: F) -> Result<()> {
        let mut value = self.get(handle)?;
        f(&mut value);
        let row = self.descriptor.to_row(&value)?;
        self.session.tracker.set_values(handle.entry, row)
    }

    pub fn mark_modified(&mut self, handle: &Tracked<T>) -> Result<()> {
        self.session.entry_of(handle)?;
        self.session.tracker.mark_modified(handle.entry)
    }

    /// Set or clear the principal behind a reference navigation. A principal
    /// that has not been inserted yet supplies its key on commit.
    pub fn set_reference<P: Entity>(
        &mut self,
        dependent: &Tracked<T>,
        navigation: &str,
        principal: Option<&Tracked<P>>,
    ) -> Result<()> {
        let (rel, is_dependent) = self.session.registry.navigation(T::NAME, navigation)?;
        if !is_dependent || rel.principal != P::NAME {
            return Err(unknown_navigation(T::NAME, navigation));
        }
        let fk_index = self
            .descriptor
            .field_index(&rel.foreign_key)
            .ok_or_else(|| unknown_navigation(T::NAME, navigation))?;
        self.session.entry_of(dependent)?;
        if let Some(p) = principal {
            self.session.entry_of(p)?;
        }
        self.session
            .tracker
            .link(dependent.entry, fk_index, principal.map(|p| p.entry))
    }

    /// Fetch entities matching `predicate`, sorted by `order_by`.
    pub async fn query(&mut self, predicate: Predicate, order_by: &[OrderBy]) -> Result<Vec<Tracked<T>>> {
        let plan = self.session.translator.translate(T::NAME, &predicate, order_by)?;
        self.run(&plan).await
    }

    /// Fetch with paging.
    pub async fn fetch(&mut self, query: &Query) -> Result<Vec<Tracked<T>>> {
        let plan = self.session.translator.plan(T::NAME, query)?;
        self.run(&plan).await
    }

    /// Fetch and materialize.
    pub async fn to_list(&mut self, query: &Query) -> Result<Vec<T>> {
        let handles = self.fetch(query).await?;
        handles.iter().map(|h| self.get(h)).collect()
    }

    pub async fn first(&mut self, query: &Query) -> Result<Option<Tracked<T>>> {
        let query = query.clone().limit(1);
        Ok(self.fetch(&query).await?.into_iter().next())
    }

    /// Look up by primary key: tracked entities first, then storage.
    pub async fn find(&mut self, key: impl Into<KeyValue>) -> Result<Option<Tracked<T>>> {
        let key = key.into();
        if let Some(id) = self.session.tracker.find(T::NAME, &key) {
            return Ok(Some(self.session.handle(id)));
        }
        let predicate = Predicate::eq(&self.descriptor.primary_key, key.to_value());
        Ok(self.query(predicate, &[]).await?.into_iter().next())
    }

    /// Entities of this set currently tracked and not deleted.
    pub fn local(&self) -> Vec<Tracked<T>> {
        self.session
            .tracker
            .entries()
            .filter(|e| e.entity() == T::NAME && e.state != EntityState::Deleted)
            .map(|e| self.session.handle(e.id))
            .collect()
    }

    async fn run(&mut self, plan: &FetchPlan) -> Result<Vec<Tracked<T>>> {
        let ids = self.session.fetch_entries(plan).await?;
        Ok(ids.into_iter().map(|id| self.session.handle(id)).collect())
    }
}
