// =============================================================================
// CORE — Le moteur de matérialisation de features complexes
// =============================================================================
//
// Ce module regroupe toute la logique du moteur : aucune base concrète,
// uniquement des traits de source, des mappings et des arbres de features.
//
// Architecture :
//   typeside    → les valeurs primitives (String, Integer, Float, Boolean, Null)
//   expression  → expressions source, prédicats, évaluateur
//   source      → les traits consommés (TabularSource, Cursor, SourceFactory)
//   mapping     → FeatureTypeMapping / AttributeMapping (immuables)
//   feature     → les features matérialisées (arbres)
//   registry    → une source partagée par configuration équivalente
//   grouping    → lignes consécutives de même identité → un groupe
//   accumulate  → groupe → propriétés, avec multiplicité
//   reference   → chaînage par référence (pointeur, aucune lecture)
//   nested      → chaînage par valeur (itérateur imbriqué)
//   path        → résolution des chemins, push-down des filtres
//   query       → la requête cliente (filtre, tri, pagination, projection)
//   iterator    → l'automate qui produit les features
//   scope       → un chargement de configuration
//   validate    → la vérification de cohérence au chargement
//
// =============================================================================

pub mod typeside;
pub mod expression;
pub mod source;
pub mod mapping;
pub mod feature;
pub mod registry;
pub mod grouping;
pub mod accumulate;
pub mod reference;
pub mod nested;
pub mod path;
pub mod query;
pub mod iterator;
pub mod scope;
pub mod validate;

#[cfg(test)]
mod tests;
