// =============================================================================
// ITERATOR — Flux de features complexes d'un type cible
// =============================================================================
//
// Automate :
//
//   Unopened ──open()──► Ready ──(plus rien)──► Exhausted
//       │                  │                        │
//       └──────────────────┴──── close() ───────────┴──► Closed
//
// open()         → découpe le filtre (poussé / résiduel), valide les chemins,
//                  ouvre un curseur trié par l'identité
// has_next()     → regarde en avance ; passe à Exhausted quand c'est fini
// next_feature() → consomme UN groupe d'identité et rend UNE feature
// close()        → idempotent ; libère curseur et tampons (aussi au Drop)
//
// Ordre des traitements : filtre résiduel → tri → offset → max → projection.
//
// Sans tri demandé, tout est en flux : un groupe lu = une feature produite.
// Avec tri, les features retenues sont toutes matérialisées au premier
// besoin, puis triées (tri stable).
//
// Toute erreur jette le groupe en cours, ferme l'itérateur et remonte.
//
// =============================================================================

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use super::accumulate::AttributeValueAccumulator;
use super::expression::{Filter, SourceFilter};
use super::feature::MaterializedFeature;
use super::grouping::IdentityGrouper;
use super::mapping::{AttributeMapping, FeatureTypeMapping, NestedLink};
use super::nested::NestedMappingResolver;
use super::path::{values_at, MappingLookup};
use super::query::{Query, SortOrder};
use super::scope::MappingScope;
use super::source::{Row, SourceQuery};
use super::typeside::Value;
use crate::error::{MappingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Unopened,
    Ready,
    Exhausted,
    Closed,
}

impl fmt::Display for IteratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IteratorState::Unopened => "non ouvert",
            IteratorState::Ready => "prêt",
            IteratorState::Exhausted => "épuisé",
            IteratorState::Closed => "fermé",
        };
        write!(f, "{}", name)
    }
}

pub struct MappingFeatureIterator {
    scope: Arc<MappingScope>,
    mapping: Arc<FeatureTypeMapping>,
    query: Query,
    /// Filtre source imposé par un parent (chaînage par valeur)
    extra_filter: Option<SourceFilter>,
    depth: usize,
    state: IteratorState,
    grouper: Option<IdentityGrouper>,
    residual: Option<Filter>,
    pending: Option<MaterializedFeature>,
    sorted: Option<VecDeque<MaterializedFeature>>,
    skipped: usize,
    delivered: usize,
    fused: bool,
}

impl MappingFeatureIterator {
    pub fn new(scope: Arc<MappingScope>, mapping: Arc<FeatureTypeMapping>, query: Query) -> Self {
        MappingFeatureIterator {
            scope,
            mapping,
            query,
            extra_filter: None,
            depth: 0,
            state: IteratorState::Unopened,
            grouper: None,
            residual: None,
            pending: None,
            sorted: None,
            skipped: 0,
            delivered: 0,
            fused: false,
        }
    }

    /// Restreint la lecture source, en plus du filtre de la requête
    pub fn with_source_filter(mut self, filter: SourceFilter) -> Self {
        self.extra_filter = Some(match self.extra_filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub(crate) fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    pub fn type_name(&self) -> &str {
        &self.mapping.target_type_name
    }

    pub fn open(&mut self) -> Result<()> {
        match self.state {
            IteratorState::Unopened => {}
            other => return Err(MappingError::illegal_state(format!("open() sur un itérateur {}", other))),
        }
        let config = self.scope.config();
        if self.depth > config.max_nesting_depth {
            return Err(MappingError::configuration(format!(
                "chaînage de '{}' au-delà de la profondeur {}",
                self.mapping.target_type_name, config.max_nesting_depth
            )));
        }

        let lookup: &dyn MappingLookup = &*self.scope;
        let paths = self.scope.paths();
        let (pushed, residual) = paths.split(&self.query.filter, &self.mapping, lookup)?;
        for path in self.query.paths() {
            paths.resolve(path, &self.mapping, lookup)?;
        }

        let source_filter = match (pushed, self.extra_filter.clone()) {
            (Some(a), Some(b)) => Some(a.and(b)),
            (a, b) => a.or(b),
        };
        let source_query = SourceQuery::new(&self.mapping.source_type)
            .with_filter(source_filter)
            .sorted_by(self.mapping.identity_expression.clone());

        let source = self.scope.source_handle(&self.mapping.target_type_name)?;
        let cursor = source.open(&source_query)?;
        self.grouper = Some(
            IdentityGrouper::new(cursor, self.mapping.identity_expression.clone(), Arc::clone(self.scope.evaluator()))
                .warn_on_unordered(config.warn_on_unordered_identity),
        );
        self.residual = residual;
        self.state = IteratorState::Ready;

        debug!(
            type_name = %self.mapping.target_type_name,
            source = source.name(),
            depth = self.depth,
            pushed = ?source_query.filter.as_ref().map(|f| f.to_string()),
            residual = ?self.residual.as_ref().map(|f| f.to_string()),
            "itérateur ouvert"
        );
        Ok(())
    }

    /// Reste-t-il une feature ? Sur un itérateur épuisé ou fermé : false.
    pub fn has_next(&mut self) -> Result<bool> {
        match self.state {
            IteratorState::Unopened => Err(MappingError::illegal_state("has_next() avant open()")),
            IteratorState::Exhausted | IteratorState::Closed => Ok(false),
            IteratorState::Ready => {
                if self.query.is_stopped() {
                    debug!(type_name = %self.mapping.target_type_name, "arrêt demandé");
                    self.close();
                    return Ok(false);
                }
                if self.pending.is_some() {
                    return Ok(true);
                }
                match self.advance() {
                    Ok(Some(feature)) => {
                        self.pending = Some(feature);
                        Ok(true)
                    }
                    Ok(None) => {
                        self.release_cursor();
                        self.state = IteratorState::Exhausted;
                        Ok(false)
                    }
                    Err(e) => {
                        self.close();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Feature suivante ; IllegalState hors de l'état Ready ou en fin de flux.
    pub fn next_feature(&mut self) -> Result<MaterializedFeature> {
        if self.state != IteratorState::Ready {
            return Err(MappingError::illegal_state(format!(
                "next_feature() sur un itérateur {}", self.state
            )));
        }
        if !self.has_next()? {
            return Err(MappingError::illegal_state("plus aucune feature"));
        }
        self.pending.take()
            .ok_or_else(|| MappingError::illegal_state("plus aucune feature"))
    }

    /// Libère tout ; sans effet la deuxième fois.
    pub fn close(&mut self) {
        if self.state == IteratorState::Closed {
            return;
        }
        self.release_cursor();
        self.pending = None;
        self.sorted = None;
        self.residual = None;
        self.state = IteratorState::Closed;
        debug!(type_name = %self.mapping.target_type_name, delivered = self.delivered, "itérateur fermé");
    }

    fn release_cursor(&mut self) {
        if let Some(mut grouper) = self.grouper.take() {
            grouper.close();
        }
    }

    fn advance(&mut self) -> Result<Option<MaterializedFeature>> {
        if let Some(max) = self.query.max_features {
            if self.delivered >= max {
                return Ok(None);
            }
        }
        loop {
            let candidate = if self.query.sort_by.is_empty() {
                self.next_matching()?
            } else {
                self.next_sorted()?
            };
            let Some(mut feature) = candidate else {
                return Ok(None);
            };
            if self.skipped < self.query.offset {
                self.skipped += 1;
                continue;
            }
            self.delivered += 1;
            if let Some(names) = &self.query.projection {
                feature.retain_properties(names);
            }
            return Ok(Some(feature));
        }
    }

    fn next_matching(&mut self) -> Result<Option<MaterializedFeature>> {
        while let Some(feature) = self.materialize_next()? {
            if self.accepts(&feature)? {
                return Ok(Some(feature));
            }
        }
        Ok(None)
    }

    fn next_sorted(&mut self) -> Result<Option<MaterializedFeature>> {
        if self.sorted.is_none() {
            let mut keyed = Vec::new();
            while let Some(feature) = self.next_matching()? {
                let keys: Vec<Value> = self.query.sort_by.iter()
                    .map(|s| values_at(&feature, &s.path).into_iter().next().unwrap_or(Value::Null))
                    .collect();
                keyed.push((keys, feature));
            }
            let orders: Vec<SortOrder> = self.query.sort_by.iter().map(|s| s.order).collect();
            keyed.sort_by(|(a, _), (b, _)| {
                a.iter().zip(b).zip(&orders)
                    .map(|((x, y), order)| match order {
                        SortOrder::Ascending => x.total_cmp(y),
                        SortOrder::Descending => y.total_cmp(x),
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
            trace!(type_name = %self.mapping.target_type_name, buffered = keyed.len(), "features triées");
            self.sorted = Some(keyed.into_iter().map(|(_, f)| f).collect());
        }
        Ok(self.sorted.as_mut().and_then(|buffer| buffer.pop_front()))
    }

    fn accepts(&self, feature: &MaterializedFeature) -> Result<bool> {
        match &self.residual {
            None => Ok(true),
            Some(filter) => filter.evaluate_with(&mut |path: &String| Ok(values_at(feature, path))),
        }
    }

    fn materialize_next(&mut self) -> Result<Option<MaterializedFeature>> {
        let Some(grouper) = self.grouper.as_mut() else {
            return Ok(None);
        };
        let Some(group) = grouper.next_group()? else {
            return Ok(None);
        };

        let mapping = Arc::clone(&self.mapping);
        let evaluator = Arc::clone(self.scope.evaluator());
        let config = self.scope.config();
        let accumulator = AttributeValueAccumulator::new(evaluator.as_ref(), &config.href_property);
        let resolver = NestedMappingResolver::new(&self.scope, self.depth);
        let mut fetch = |attribute: &AttributeMapping, link: &NestedLink, row: &Row| -> Result<Vec<MaterializedFeature>> {
            resolver.resolve(attribute, link, row)
        };

        let mut feature = MaterializedFeature::new(&mapping.target_type_name, Some(group.feature_id()));
        for attribute in &mapping.attribute_mappings {
            accumulator.accumulate(&mut feature, attribute, &group.rows, &mut fetch)?;
        }
        trace!(type_name = %mapping.target_type_name, id = %group.identity, rows = group.rows.len(), "feature matérialisée");
        Ok(Some(feature))
    }
}

impl Iterator for MappingFeatureIterator {
    type Item = Result<MaterializedFeature>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        if self.state == IteratorState::Unopened {
            if let Err(e) = self.open() {
                self.fused = true;
                return Some(Err(e));
            }
        }
        match self.has_next() {
            Ok(true) => {
                let next = self.next_feature();
                if next.is_err() {
                    self.fused = true;
                }
                Some(next)
            }
            Ok(false) => {
                self.fused = true;
                None
            }
            Err(e) => {
                self.fused = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for MappingFeatureIterator {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MappingFeatureIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingFeatureIterator")
            .field("type_name", &self.mapping.target_type_name)
            .field("state", &self.state)
            .field("depth", &self.depth)
            .field("delivered", &self.delivered)
            .finish()
    }
}
