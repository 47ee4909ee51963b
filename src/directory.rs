//! Existence checks for entities owned outside this crate.
//!
//! Users, professionals, locations, communities and plans live in other
//! services. The engine only ever asks whether an id refers to a live record.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashSet;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::Entity;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn exists(&self, entity: Entity, id: Ulid) -> Result<bool, DirectoryError>;
}

/// Seed file layout for [`InMemoryDirectory::load_json`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DirectorySeed {
    users: Vec<Ulid>,
    professionals: Vec<Ulid>,
    locations: Vec<Ulid>,
    communities: Vec<Ulid>,
    plans: Vec<Ulid>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    known: DashSet<(Entity, Ulid)>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load ids from a JSON object with `users`, `professionals`, `locations`,
    /// `communities` and `plans` arrays. Missing arrays are empty.
    pub fn load_json(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read(path)?;
        let seed: DirectorySeed = serde_json::from_slice(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let dir = Self::new();
        let groups = [
            (Entity::User, seed.users),
            (Entity::Professional, seed.professionals),
            (Entity::Location, seed.locations),
            (Entity::Community, seed.communities),
            (Entity::Plan, seed.plans),
        ];
        for (entity, ids) in groups {
            for id in ids {
                dir.register(entity, id);
            }
        }
        Ok(dir)
    }

    pub fn register(&self, entity: Entity, id: Ulid) {
        self.known.insert((entity, id));
    }

    pub fn forget(&self, entity: Entity, id: Ulid) {
        self.known.remove(&(entity, id));
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn exists(&self, entity: Entity, id: Ulid) -> Result<bool, DirectoryError> {
        Ok(self.known.contains(&(entity, id)))
    }
}
