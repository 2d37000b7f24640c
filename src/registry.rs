// MIT License - Copyright (c) 2026 Peter Wright
// Durable MAC -> entity registry

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::devices::{Entity, Mac};
use crate::error::{GatewayError, Result};

pub type EntityMap = BTreeMap<Mac, Entity>;

/// Backing store for the registry.
pub trait RegistryBackend {
    /// Read every persisted entity. A store that does not exist yet reads as
    /// empty.
    fn read(&self) -> Result<EntityMap>;

    /// Replace the persisted contents with `entities`.
    fn write(&self, entities: &EntityMap) -> Result<()>;
}

/// On-disk layout: one `[sensors.<MAC>]` table per entity.
#[derive(Debug, Serialize)]
struct RegistryFile<'a> {
    sensors: &'a EntityMap,
}

/// The file as written by hand: keys are checked and normalized after
/// parsing so two spellings of one MAC are caught.
#[derive(Debug, Deserialize)]
struct RawRegistryFile {
    #[serde(default)]
    sensors: BTreeMap<String, Entity>,
}

/// Human-editable TOML registry file.
#[derive(Debug, Clone)]
pub struct TomlFile {
    path: PathBuf,
}

impl TomlFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryBackend for TomlFile {
    fn read(&self) -> Result<EntityMap> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No registry at {}, starting empty", self.path.display());
                return Ok(EntityMap::new());
            }
            Err(source) => {
                return Err(GatewayError::Persistence {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let parse_err = |reason: String| GatewayError::Parse {
            path: self.path.clone(),
            reason,
        };
        let file: RawRegistryFile = toml::from_str(&text).map_err(|e| parse_err(e.to_string()))?;

        let mut entities = EntityMap::new();
        for (key, entity) in file.sensors {
            let mac = Mac::parse(&key).map_err(|e| parse_err(e.to_string()))?;
            if entities.contains_key(&mac) {
                return Err(parse_err(format!("sensor {mac} is listed more than once")));
            }
            entities.insert(mac, entity);
        }
        Ok(entities)
    }

    fn write(&self, entities: &EntityMap) -> Result<()> {
        let file = RegistryFile { sensors: entities };
        let text = toml::to_string(&file).map_err(|e| GatewayError::Serialize(e.to_string()))?;
        write_atomic(&self.path, &text)
    }
}

/// Write `text` to a sibling temp file and rename it over `path`, so readers
/// never see a half-written file.
pub(crate) fn write_atomic(path: &Path, text: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    let persist_err = |source| GatewayError::Persistence {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(&tmp, text).map_err(persist_err)?;
    std::fs::rename(&tmp, path).map_err(persist_err)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// What a reload changed relative to the previous snapshot.
#[derive(Debug, Default)]
pub struct ReloadDiff {
    pub added: Vec<Mac>,
    pub changed: Vec<Mac>,
    /// Dropped entities, with their last known configuration.
    pub removed: Vec<(Mac, Entity)>,
}

impl ReloadDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// The authoritative MAC -> entity mapping.
///
/// There is a single writer; readers take a [`Registry::snapshot`], an
/// immutable map that is swapped whole on every mutation. A mutation is
/// persisted before it becomes visible, so a failed write leaves the
/// in-memory registry at the last persisted state.
pub struct Registry<S> {
    backend: S,
    entities: Arc<EntityMap>,
}

impl<S: RegistryBackend> Registry<S> {
    /// Load the registry from `backend`. Every keypad's pins are validated.
    pub fn load(backend: S) -> Result<Self> {
        let entities = read_checked(&backend)?;
        info!("Loaded {} registered entities", entities.len());
        Ok(Self {
            backend,
            entities: Arc::new(entities),
        })
    }

    pub fn snapshot(&self) -> Arc<EntityMap> {
        Arc::clone(&self.entities)
    }

    pub fn get(&self, mac: &Mac) -> Option<&Entity> {
        self.entities.get(mac)
    }

    pub fn contains(&self, mac: &Mac) -> bool {
        self.entities.contains_key(mac)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Persist the current contents.
    pub fn save(&self) -> Result<()> {
        self.backend.write(&self.entities)
    }

    /// Insert or replace an entity. Returns the previous entry.
    pub fn upsert(&mut self, mac: Mac, entity: Entity) -> Result<Option<Entity>> {
        entity.check()?;
        let mut next = (*self.entities).clone();
        let previous = next.insert(mac.clone(), entity);
        self.commit(next)?;
        debug!("Registry: upserted {mac}");
        Ok(previous)
    }

    /// Remove an entity. Returns `false` if it was not registered.
    pub fn remove(&mut self, mac: &Mac) -> Result<bool> {
        if !self.entities.contains_key(mac) {
            return Ok(false);
        }
        let mut next = (*self.entities).clone();
        next.remove(mac);
        self.commit(next)?;
        info!("Registry: removed {mac}");
        Ok(true)
    }

    /// Re-read the backing store and swap it in. On a read or validation
    /// failure the current contents are kept.
    pub fn reload(&mut self) -> Result<ReloadDiff> {
        let next = read_checked(&self.backend)?;
        let mut diff = ReloadDiff::default();
        for (mac, entity) in &next {
            match self.entities.get(mac) {
                None => diff.added.push(mac.clone()),
                Some(old) if old != entity => diff.changed.push(mac.clone()),
                Some(_) => {}
            }
        }
        for (mac, entity) in self.entities.iter() {
            if !next.contains_key(mac) {
                diff.removed.push((mac.clone(), entity.clone()));
            }
        }
        info!(
            "Registry reloaded: {} added, {} changed, {} removed",
            diff.added.len(),
            diff.changed.len(),
            diff.removed.len()
        );
        self.entities = Arc::new(next);
        Ok(diff)
    }

    fn commit(&mut self, next: EntityMap) -> Result<()> {
        if let Err(e) = self.backend.write(&next) {
            warn!("Registry write failed, keeping last persisted state: {e}");
            return Err(e);
        }
        self.entities = Arc::new(next);
        Ok(())
    }
}

fn read_checked<S: RegistryBackend>(backend: &S) -> Result<EntityMap> {
    let entities = backend.read()?;
    for (mac, entity) in &entities {
        entity.check().inspect_err(|e| warn!("Invalid entry for {mac}: {e}"))?;
    }
    Ok(entities)
}
