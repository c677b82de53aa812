// =============================================================================
// QUERY — Ce que le client demande à un type cible
// =============================================================================
//
// Une Query porte :
//   filter        → prédicat sur des CHEMINS de propriétés du type cible
//   projection    → propriétés de premier niveau à garder (toutes si None)
//   sort_by       → tri des features matérialisées (chemin + sens)
//   max_features  → nombre maximal de features rendues
//   offset        → features ignorées avant la première rendue
//   stop          → signal d'arrêt coopératif partagé
//
// Le filtre est découpé par le PropertyPathResolver : ce qui se traduit en
// termes de la source est poussé vers la requête tabulaire, le reste est
// évalué sur les features matérialisées.
//
// =============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use super::expression::{Filter, Predicate};

/// Sens de tri
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Une clé de tri : chemin de propriété + sens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortBy {
    pub path: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub filter: Filter,
    pub projection: Option<Vec<String>>,
    pub sort_by: Vec<SortBy>,
    pub max_features: Option<usize>,
    pub offset: usize,
    stop: Option<Arc<AtomicBool>>,
}

impl Default for Query {
    fn default() -> Self {
        Query {
            filter: Predicate::Include,
            projection: None,
            sort_by: Vec::new(),
            max_features: None,
            offset: 0,
            stop: None,
        }
    }
}

impl Query {
    /// Toutes les features, sans filtre
    pub fn all() -> Self {
        Query::default()
    }

    pub fn filtered(filter: Filter) -> Self {
        Query { filter, ..Query::default() }
    }

    pub fn with_projection(mut self, names: &[&str]) -> Self {
        self.projection = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn sorted_by(mut self, path: &str, order: SortOrder) -> Self {
        self.sort_by.push(SortBy { path: path.to_string(), order });
        self
    }

    pub fn with_max_features(mut self, max: usize) -> Self {
        self.max_features = Some(max);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Arrêt coopératif : une fois le drapeau levé, l'itérateur se ferme.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.as_ref().map(|s| s.load(Ordering::SeqCst)).unwrap_or(false)
    }

    /// Tous les chemins cités par la requête (filtre, tri, projection)
    pub fn paths(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.filter.operands().into_iter().map(String::as_str).collect();
        out.extend(self.sort_by.iter().map(|s| s.path.as_str()));
        if let Some(names) = &self.projection {
            out.extend(names.iter().map(String::as_str));
        }
        out
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WHERE {}", self.filter)?;
        if !self.sort_by.is_empty() {
            let keys: Vec<String> = self.sort_by.iter()
                .map(|s| match s.order {
                    SortOrder::Ascending => format!("{} ASC", s.path),
                    SortOrder::Descending => format!("{} DESC", s.path),
                })
                .collect();
            write!(f, " ORDER BY {}", keys.join(", "))?;
        }
        if self.offset > 0 {
            write!(f, " OFFSET {}", self.offset)?;
        }
        if let Some(max) = self.max_features {
            write!(f, " LIMIT {}", max)?;
        }
        Ok(())
    }
}
