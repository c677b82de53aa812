// =============================================================================
// CONFIG — Réglages du moteur
// =============================================================================
//
// Les mappings eux-mêmes sont produits par un chargeur externe. Ici, on ne
// règle que le comportement du moteur : nom de la propriété cliente qui porte
// les références, garde-fou de profondeur d'imbrication, etc.
//
// Peut être désérialisé depuis du JSON :
//
// ```json
// { "href_property": "xlink:href", "max_nesting_depth": 16 }
// ```
//
// =============================================================================

use serde::{Deserialize, Serialize};
use crate::error::Result;

/// Configuration du moteur de matérialisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Nom de la propriété cliente qui reçoit le pointeur d'une référence
    pub href_property: String,
    /// Profondeur maximale de chaînage par valeur avant d'abandonner
    pub max_nesting_depth: usize,
    /// Tracer un avertissement quand la source ne livre pas les identités triées
    pub warn_on_unordered_identity: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            href_property: "xlink:href".to_string(),
            max_nesting_depth: 32,
            warn_on_unordered_identity: true,
        }
    }
}

impl EngineConfig {
    /// Lit une configuration JSON ; les champs absents prennent leur valeur par défaut.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
