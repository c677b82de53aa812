// =============================================================================
// SOURCE — L'abstraction tabulaire consommée par le moteur
// =============================================================================
//
// Le moteur ne connaît AUCUNE base concrète. Il consomme :
//   TabularSource  → ouvre un curseur pour une requête (filtre + tri)
//   Cursor         → livre des lignes une à une, puis None
//   Row            → colonnes nommées → Value
//   SourceFactory  → fabrique une source à partir d'un descripteur
//
// Les adaptateurs réels (SQL, fichiers plats...) vivent hors du cœur ;
// `backend::memory` fournit une source en mémoire pour les tests et la démo.
//
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use super::expression::{Expression, SourceFilter};
use super::typeside::Value;
use crate::error::Result;

/// Une ligne tabulaire : colonnes nommées, dans l'ordre de la source.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new<S: Into<String>>(columns: Vec<(S, Value)>) -> Self {
        Row {
            columns: columns.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Valeur d'une colonne
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Requête adressée à une source : type source + filtre poussé + clés de tri.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceQuery {
    /// Table (ou couche) lue dans la source
    pub source_type: String,
    pub filter: Option<SourceFilter>,
    /// Tri ascendant stable, clé par clé
    pub sort_by: Vec<Expression>,
}

impl SourceQuery {
    pub fn new(source_type: &str) -> Self {
        SourceQuery {
            source_type: source_type.to_string(),
            filter: None,
            sort_by: Vec::new(),
        }
    }

    pub fn sorted_by(mut self, expr: Expression) -> Self {
        self.sort_by.push(expr);
        self
    }

    pub fn with_filter(mut self, filter: Option<SourceFilter>) -> Self {
        self.filter = filter;
        self
    }
}

/// Curseur ouvert sur une source.
pub trait Cursor {
    /// Ligne suivante, ou None en fin de source
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Libère le curseur. Doit être idempotent.
    fn close(&mut self);
}

/// Source tabulaire partagée par plusieurs mappings.
pub trait TabularSource: Send + Sync {
    /// Nom lisible (logs)
    fn name(&self) -> &str;

    /// Ouvre un curseur ; SourceUnavailable si la requête est refusée.
    fn open(&self, query: &SourceQuery) -> Result<Box<dyn Cursor>>;

    /// Appelé par le registre quand plus personne ne référence la source.
    fn dispose(&self) {}
}

/// Descripteur opaque d'une source (type + paramètres de connexion).
///
/// Deux descripteurs sont équivalents si leurs formes canoniques sont égales,
/// quelle que soit l'identité des objets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub kind: String,
    pub params: BTreeMap<String, String>,
}

impl SourceDescriptor {
    pub fn new(kind: &str) -> Self {
        SourceDescriptor {
            kind: kind.to_string(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// Forme canonique : type en minuscules, clés et valeurs sans espaces
    /// parasites, clés triées, sérialisée en JSON.
    pub fn canonical_key(&self) -> String {
        let params: BTreeMap<String, String> = self.params.iter()
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let canonical = SourceDescriptor {
            kind: self.kind.trim().to_lowercase(),
            params,
        };
        // Un BTreeMap<String, String> se sérialise toujours
        serde_json::to_string(&canonical).unwrap_or_else(|_| format!("{:?}", canonical))
    }
}

/// Fabrique de sources, injectée dans le registre.
pub trait SourceFactory: Send + Sync {
    fn create(&self, descriptor: &SourceDescriptor) -> Result<Arc<dyn TabularSource>>;
}
