// =============================================================================
// SCOPE — Un chargement de configuration
// =============================================================================
//
// Un MappingScope regroupe les mappings chargés ENSEMBLE :
//   - validés en bloc au chargement (validate)
//   - un SourceRegistry propre : les mappings d'une même base partagent
//     une seule source, jamais avec un autre chargement
//   - des scopes liés, chargés avant, où chercher les types imbriqués
//     absents localement
//
//   ┌──────── scope "mappedfeature" ────────┐      ┌── scope "units" ──┐
//   │ MappedFeature ──specification──► ─────┼─────►│ GeologicUnit      │
//   │ registre A : memory:geo               │      │ registre B        │
//   └───────────────────────────────────────┘      └───────────────────┘
//
// dispose() rend toutes les poignées ; appelé aussi au Drop.
//
// =============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use super::expression::{DefaultEvaluator, ExpressionEvaluator};
use super::iterator::MappingFeatureIterator;
use super::mapping::{names_match, FeatureTypeMapping};
use super::path::{MappingLookup, PropertyPathResolver};
use super::query::Query;
use super::registry::{SharedSourceHandle, SourceRegistry};
use super::source::{SourceFactory, TabularSource};
use super::validate;
use crate::config::EngineConfig;
use crate::error::{MappingError, Result};

pub struct MappingScope {
    name: String,
    mappings: Vec<Arc<FeatureTypeMapping>>,
    linked: Vec<Arc<MappingScope>>,
    registry: SourceRegistry,
    /// Une poignée par mapping, dans l'ordre des mappings
    handles: Mutex<Vec<(String, SharedSourceHandle)>>,
    config: EngineConfig,
    evaluator: Arc<dyn ExpressionEvaluator>,
    paths: PropertyPathResolver,
    disposed: AtomicBool,
}

impl MappingScope {
    /// Charge un ensemble de mappings avec l'évaluateur par défaut.
    pub fn load(
        name: &str,
        mappings: Vec<FeatureTypeMapping>,
        factory: Arc<dyn SourceFactory>,
        linked: Vec<Arc<MappingScope>>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        MappingScope::load_with_evaluator(name, mappings, factory, linked, config, Arc::new(DefaultEvaluator))
    }

    pub fn load_with_evaluator(
        name: &str,
        mappings: Vec<FeatureTypeMapping>,
        factory: Arc<dyn SourceFactory>,
        linked: Vec<Arc<MappingScope>>,
        config: EngineConfig,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Result<Arc<Self>> {
        validate::validate_scope(&mappings, &linked).map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            MappingError::configuration(format!("scope '{}' invalide : {}", name, messages.join(" ; ")))
        })?;

        let registry = SourceRegistry::new(factory);
        let mut handles = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            match registry.acquire(&mapping.source) {
                Ok(handle) => handles.push((mapping.target_type_name.clone(), handle)),
                Err(e) => {
                    for (_, handle) in handles {
                        if let Err(release) = registry.release(handle) {
                            warn!(scope = name, error = %release, "libération impossible");
                        }
                    }
                    return Err(e);
                }
            }
        }

        debug!(
            scope = name,
            registry = %registry.id(),
            mappings = mappings.len(),
            sources = registry.live_sources(),
            "scope chargé"
        );
        Ok(Arc::new(MappingScope {
            name: name.to_string(),
            mappings: mappings.into_iter().map(Arc::new).collect(),
            linked,
            paths: PropertyPathResolver::new(&config.href_property),
            registry,
            handles: Mutex::new(handles),
            config,
            evaluator,
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifiant du registre de sources de ce chargement
    pub fn registry_id(&self) -> Uuid {
        self.registry.id()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    pub fn paths(&self) -> &PropertyPathResolver {
        &self.paths
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.mappings.iter().map(|m| m.target_type_name.as_str()).collect()
    }

    /// Mapping de ce scope seulement (nom exact, sinon partie locale)
    pub fn mapping(&self, type_name: &str) -> Option<Arc<FeatureTypeMapping>> {
        self.mappings.iter()
            .find(|m| m.target_type_name == type_name)
            .or_else(|| self.mappings.iter().find(|m| names_match(&m.target_type_name, type_name)))
            .cloned()
    }

    /// Mapping et scope propriétaire : ce scope d'abord, puis les scopes liés.
    pub fn resolve_mapping(self: &Arc<Self>, type_name: &str) -> Option<(Arc<MappingScope>, Arc<FeatureTypeMapping>)> {
        if let Some(mapping) = self.mapping(type_name) {
            return Some((Arc::clone(self), mapping));
        }
        self.linked.iter().find_map(|l| l.resolve_mapping(type_name))
    }

    /// Source partagée d'un type de ce scope
    pub fn source_handle(&self, type_name: &str) -> Result<Arc<dyn TabularSource>> {
        if self.is_disposed() {
            return Err(MappingError::source_unavailable(format!("scope '{}' libéré", self.name)));
        }
        let handles = self.handles.lock();
        handles.iter()
            .find(|(t, _)| names_match(t, type_name))
            .map(|(_, h)| h.source())
            .ok_or_else(|| MappingError::configuration(format!(
                "type '{}' absent du scope '{}'", type_name, self.name
            )))
    }

    /// Les deux types lisent-ils la même instance de source ?
    pub fn same_source(&self, a: &str, b: &str) -> Result<bool> {
        let handles = self.handles.lock();
        let find = |name: &str| {
            handles.iter()
                .find(|(t, _)| names_match(t, name))
                .map(|(_, h)| h)
                .ok_or_else(|| MappingError::configuration(format!("type '{}' absent du scope '{}'", name, self.name)))
        };
        Ok(find(a)?.same_source(find(b)?))
    }

    /// Ouvre un flux de features d'un type (de ce scope ou d'un scope lié).
    pub fn features(self: &Arc<Self>, type_name: &str, query: Query) -> Result<MappingFeatureIterator> {
        let (owner, mapping) = self.resolve_mapping(type_name).ok_or_else(|| {
            MappingError::configuration(format!("type '{}' inconnu du scope '{}'", type_name, self.name))
        })?;
        let mut iterator = MappingFeatureIterator::new(owner, mapping, query);
        iterator.open()?;
        Ok(iterator)
    }

    /// Rend toutes les sources ; sans effet la deuxième fois.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<(String, SharedSourceHandle)> = std::mem::take(&mut *self.handles.lock());
        for (type_name, handle) in handles {
            if let Err(e) = self.registry.release(handle) {
                warn!(scope = %self.name, type_name = %type_name, error = %e, "libération impossible");
            }
        }
        debug!(scope = %self.name, "scope libéré");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl MappingLookup for MappingScope {
    fn lookup(&self, type_name: &str) -> Option<Arc<FeatureTypeMapping>> {
        self.mapping(type_name)
            .or_else(|| self.linked.iter().find_map(|l| l.lookup(type_name)))
    }
}

impl Drop for MappingScope {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for MappingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingScope")
            .field("name", &self.name)
            .field("types", &self.type_names())
            .field("linked", &self.linked.iter().map(|l| l.name()).collect::<Vec<_>>())
            .field("registry", &self.registry)
            .finish()
    }
}
