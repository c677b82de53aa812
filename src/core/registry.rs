// =============================================================================
// REGISTRY — Une source sous-jacente par configuration équivalente
// =============================================================================
//
// Plusieurs mappings d'un même chargement pointent souvent vers la même base
// (même type, mêmes paramètres). On ne veut alors qu'UNE instance de source,
// partagée et comptée :
//
//   acquire(desc) → nouvelle source si aucune équivalente n'est vivante,
//                   sinon compteur + 1
//   release(h)    → compteur - 1, dispose() à zéro
//
// L'équivalence porte sur la forme canonique du descripteur, pas sur
// l'identité de l'objet.
//
// PORTÉE : un registre = un chargement de configuration. Deux chargements
// indépendants ont deux registres, donc jamais de source commune, même avec
// des descripteurs identiques. Le registre est injecté, jamais global.
//
// Les compteurs sont protégés par un mutex : des ouvertures / libérations
// concurrentes entre mappings frères restent correctes.
//
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;
use super::source::{SourceDescriptor, SourceFactory, TabularSource};
use crate::error::{MappingError, Result};

struct RegistryEntry {
    source: Arc<dyn TabularSource>,
    refs: usize,
}

/// Poignée comptée vers une source partagée.
///
/// Volontairement non clonable : chaque poignée correspond à exactement un
/// `acquire` et doit être rendue par exactement un `release`.
pub struct SharedSourceHandle {
    key: String,
    registry_id: Uuid,
    source: Arc<dyn TabularSource>,
}

impl SharedSourceHandle {
    pub fn source(&self) -> Arc<dyn TabularSource> {
        Arc::clone(&self.source)
    }

    /// Forme canonique du descripteur
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn registry_id(&self) -> Uuid {
        self.registry_id
    }

    /// Les deux poignées désignent-elles la même instance de source ?
    pub fn same_source(&self, other: &SharedSourceHandle) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.source) as *const (),
            Arc::as_ptr(&other.source) as *const (),
        )
    }
}

impl fmt::Debug for SharedSourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSourceHandle")
            .field("key", &self.key)
            .field("registry_id", &self.registry_id)
            .field("source", &self.source.name())
            .finish()
    }
}

/// Cache de sources d'un scope.
pub struct SourceRegistry {
    id: Uuid,
    factory: Arc<dyn SourceFactory>,
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl SourceRegistry {
    pub fn new(factory: Arc<dyn SourceFactory>) -> Self {
        SourceRegistry {
            id: Uuid::new_v4(),
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Obtient la source d'un descripteur, en la créant au premier usage.
    pub fn acquire(&self, descriptor: &SourceDescriptor) -> Result<SharedSourceHandle> {
        let key = descriptor.canonical_key();
        let mut entries = self.entries.lock();
        let source = match entries.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                debug!(registry = %self.id, key = %key, refs = entry.refs, "source partagée réutilisée");
                Arc::clone(&entry.source)
            }
            None => {
                let source = self.factory.create(descriptor)?;
                debug!(registry = %self.id, key = %key, source = source.name(), "source créée");
                entries.insert(key.clone(), RegistryEntry {
                    source: Arc::clone(&source),
                    refs: 1,
                });
                source
            }
        };
        Ok(SharedSourceHandle {
            key,
            registry_id: self.id,
            source,
        })
    }

    /// Rend une poignée ; la source est libérée quand le compteur tombe à zéro.
    pub fn release(&self, handle: SharedSourceHandle) -> Result<()> {
        if handle.registry_id != self.id {
            return Err(MappingError::configuration(format!(
                "la poignée '{}' appartient au registre {}, pas à {}",
                handle.key, handle.registry_id, self.id
            )));
        }
        let disposed = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(&handle.key).ok_or_else(|| {
                MappingError::configuration(format!("source '{}' déjà libérée", handle.key))
            })?;
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&handle.key).map(|e| e.source)
            } else {
                None
            }
        };
        if let Some(source) = disposed {
            debug!(registry = %self.id, key = %handle.key, "source libérée");
            source.dispose();
        }
        Ok(())
    }

    /// Nombre de références vivantes vers la source d'un descripteur
    pub fn ref_count(&self, descriptor: &SourceDescriptor) -> usize {
        self.entries.lock()
            .get(&descriptor.canonical_key())
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    /// Nombre d'instances de sources vivantes
    pub fn live_sources(&self) -> usize {
        self.entries.lock().len()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("id", &self.id)
            .field("live_sources", &self.live_sources())
            .finish()
    }
}
