//! JSON file record store
//!
//! Each collection lives in `<data_dir>/<collection>.json` as one JSON object
//! keyed by record id. Every mutation rewrites the whole file through a
//! temporary file in the same directory which is then renamed over the old
//! one, so a reader (or a restart after a crash) only ever sees a complete
//! collection.
//!
//! The store has no locking of its own. Callers serialize access, the
//! service keeps it behind a single `Mutex`.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use ims_common::models::{Image, Job, PublicKey, Recipe, RemoteBuildNode};
use ims_common::{Error, Record, Result};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

/// One collection of records, in listing order
pub struct Collection<T> {
    path: PathBuf,
    records: HashMap<Uuid, T>,
    order: Vec<Uuid>,
}

fn corrupt(path: &Path, reason: impl ToString) -> Error {
    Error::CorruptStore {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

impl<T: Record> Collection<T> {
    fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(format!("{}.json", T::COLLECTION));

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No {} file at {}, starting empty", T::COLLECTION, path.display());
                return Ok(Self {
                    path,
                    records: HashMap::new(),
                    order: Vec::new(),
                });
            }
            Err(e) => return Err(corrupt(&path, e)),
        };

        let raw: BTreeMap<String, Value> =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(&path, e))?;

        let mut loaded = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let record: T = serde_json::from_value(value)
                .map_err(|e| corrupt(&path, format!("record {}: {}", key, e)))?;
            if record.id().to_string() != key {
                return Err(corrupt(
                    &path,
                    format!("record {} is stored under key {}", record.id(), key),
                ));
            }
            loaded.push(record);
        }

        loaded.sort_by(|a, b| {
            a.created()
                .cmp(&b.created())
                .then_with(|| a.id().cmp(&b.id()))
        });

        let order = loaded.iter().map(Record::id).collect();
        let records = loaded.into_iter().map(|r| (r.id(), r)).collect();

        Ok(Self {
            path,
            records,
            order,
        })
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, id: Uuid) -> Option<&T> {
        self.records.get(&id)
    }

    fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Write the whole collection, replacing the file atomically
    fn persist(&self) -> Result<()> {
        let mut document = Map::new();
        for record in self.iter() {
            document.insert(record.id().to_string(), serde_json::to_value(record)?);
        }
        let bytes = serde_json::to_vec_pretty(&Value::Object(document))?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;

        debug!(
            "Persisted {} {} record(s) to {}",
            self.len(),
            T::COLLECTION,
            self.path.display()
        );
        Ok(())
    }

    /// Insert or replace a record and persist. The in-memory copy is
    /// rolled back if the write fails.
    fn commit(&mut self, record: T) -> Result<T> {
        let id = record.id();
        let previous = self.records.insert(id, record.clone());
        if previous.is_none() {
            self.order.push(id);
        }

        if let Err(e) = self.persist() {
            match previous {
                Some(previous) => {
                    self.records.insert(id, previous);
                }
                None => {
                    self.records.remove(&id);
                    self.order.retain(|other| *other != id);
                }
            }
            return Err(e);
        }

        Ok(record)
    }
}

/// Records the [`Storage`] keeps a collection for
pub trait StoredRecord: Record {
    fn collection(storage: &Storage) -> &Collection<Self>;
    fn collection_mut(storage: &mut Storage) -> &mut Collection<Self>;
}

macro_rules! stored_record {
    ($ty:ty, $field:ident) => {
        impl StoredRecord for $ty {
            fn collection(storage: &Storage) -> &Collection<Self> {
                &storage.$field
            }

            fn collection_mut(storage: &mut Storage) -> &mut Collection<Self> {
                &mut storage.$field
            }
        }
    };
}

stored_record!(Image, images);
stored_record!(Recipe, recipes);
stored_record!(PublicKey, public_keys);
stored_record!(Job, jobs);
stored_record!(RemoteBuildNode, remote_build_nodes);

/// Record store for every collection the service owns
pub struct Storage {
    data_dir: PathBuf,
    images: Collection<Image>,
    recipes: Collection<Recipe>,
    public_keys: Collection<PublicKey>,
    jobs: Collection<Job>,
    remote_build_nodes: Collection<RemoteBuildNode>,
}

impl Storage {
    /// Load every collection from `data_dir`.
    ///
    /// Missing files are empty collections. Any unreadable file fails with
    /// `CorruptStore`; the service must not start on partial data.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let storage = Self {
            images: Collection::load(&data_dir)?,
            recipes: Collection::load(&data_dir)?,
            public_keys: Collection::load(&data_dir)?,
            jobs: Collection::load(&data_dir)?,
            remote_build_nodes: Collection::load(&data_dir)?,
            data_dir,
        };

        info!(
            images = storage.images.len(),
            recipes = storage.recipes.len(),
            public_keys = storage.public_keys.len(),
            jobs = storage.jobs.len(),
            remote_build_nodes = storage.remote_build_nodes.len(),
            "Loaded record store from {}",
            storage.data_dir.display()
        );

        Ok(storage)
    }

    /// Get a record, deleted or not
    pub fn get<T: StoredRecord>(&self, id: Uuid) -> Result<T> {
        T::collection(self)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(T::KIND, id))
    }

    /// Get a record that has not been soft-deleted
    pub fn get_live<T: StoredRecord>(&self, id: Uuid) -> Result<T> {
        match T::collection(self).get(id) {
            Some(record) if !record.is_deleted() => Ok(record.clone()),
            _ => Err(Error::not_found(T::KIND, id)),
        }
    }

    /// Get a soft-deleted record
    pub fn get_deleted<T: StoredRecord>(&self, id: Uuid) -> Result<T> {
        match T::collection(self).get(id) {
            Some(record) if record.is_deleted() => Ok(record.clone()),
            _ => Err(Error::not_found(T::KIND, id)),
        }
    }

    /// Records in listing order; soft-deleted ones only when asked for
    pub fn list<T: StoredRecord>(&self, include_deleted: bool) -> impl Iterator<Item = &T> + '_ {
        T::collection(self)
            .iter()
            .filter(move |record| include_deleted || !record.is_deleted())
    }

    pub fn list_deleted<T: StoredRecord>(&self) -> impl Iterator<Item = &T> + '_ {
        T::collection(self).iter().filter(|record| record.is_deleted())
    }

    /// Insert a new record
    pub fn create<T: StoredRecord>(&mut self, record: T) -> Result<T> {
        record.validate()?;

        let collection = T::collection_mut(self);
        if collection.get(record.id()).is_some() {
            return Err(Error::validation(format!(
                "A {} with id {} already exists",
                T::KIND,
                record.id()
            )));
        }

        let record = collection.commit(record)?;
        info!("Created {} {}", T::KIND, record.id());
        Ok(record)
    }

    /// Merge top-level fields into a live record. Each named field is
    /// replaced wholesale, nested objects are not merged.
    pub fn update<T: StoredRecord>(&mut self, id: Uuid, patch: &Map<String, Value>) -> Result<T> {
        let current = self.get_live::<T>(id)?;

        for key in patch.keys() {
            if key == "id" || key == "created" {
                return Err(Error::validation(format!("{} may not be changed", key)));
            }
            if !T::PATCHABLE.contains(&key.as_str()) {
                return Err(Error::validation(format!(
                    "{} is not a patchable field of a {}",
                    key,
                    T::KIND
                )));
            }
        }

        let mut value = serde_json::to_value(&current)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::validation(format!("{} {} is not an object", T::KIND, id)))?;
        for (key, field) in patch {
            object.insert(key.clone(), field.clone());
        }

        let updated: T = serde_json::from_value(value)
            .map_err(|e| Error::validation(format!("Invalid {} patch: {}", T::KIND, e)))?;
        updated.validate()?;
        current.validate_patch(&updated)?;

        let updated = T::collection_mut(self).commit(updated)?;
        info!("Updated {} {}", T::KIND, id);
        Ok(updated)
    }

    /// Store a new version of an existing record, bypassing patch rules.
    /// Used by the orchestrator and artifact manager for fields users may
    /// not set directly.
    pub fn replace<T: StoredRecord>(&mut self, record: T) -> Result<T> {
        if T::collection(self).get(record.id()).is_none() {
            return Err(Error::not_found(T::KIND, record.id()));
        }
        record.validate()?;
        T::collection_mut(self).commit(record)
    }

    /// Mark a record deleted. Deleting it again keeps the first timestamp.
    pub fn soft_delete<T: StoredRecord>(&mut self, id: Uuid) -> Result<T> {
        let mut record = self.get::<T>(id)?;
        if record.is_deleted() {
            debug!("{} {} is already deleted", T::KIND, id);
            return Ok(record);
        }

        record.set_deleted(Some(Utc::now()));
        let record = T::collection_mut(self).commit(record)?;
        info!("Soft-deleted {} {}", T::KIND, id);
        Ok(record)
    }

    /// Clear the deleted mark, leaving every other field as stored
    pub fn restore<T: StoredRecord>(&mut self, id: Uuid) -> Result<T> {
        let mut record = self.get_deleted::<T>(id)?;
        record.set_deleted(None);
        let record = T::collection_mut(self).commit(record)?;
        info!("Restored {} {}", T::KIND, id);
        Ok(record)
    }
}
