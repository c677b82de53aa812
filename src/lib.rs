// =============================================================================
// FEATURECHAIN — Matérialisation de features complexes en Rust
// =============================================================================
//
// featurechain transforme des lignes tabulaires dénormalisées en features
// complexes arborescentes, conformes à un schéma imbriqué déclaré :
//
//   lignes (ID, NAME, ...)  ──mapping──►  GeologicUnit
//                                           gml:name (×3)
//                                           gsml:composition → CompositionPart
//                                           gsml:occurrence  ∅ {xlink:href}
//
// Architecture :
//   core/     → le moteur (mappings, regroupement, chaînage, itération)
//   backend/  → les sources concrètes (ici : une source en mémoire)
//   config    → réglages du moteur
//   error     → les erreurs
//
// Concepts fondamentaux :
//   FeatureTypeMapping = comment fabriquer un type cible depuis une source
//   Chaînage par valeur    = la feature imbriquée est matérialisée
//   Chaînage par référence = seul un pointeur (xlink:href) est produit
//   MappingScope = un chargement ; ses mappings partagent leurs sources
//
// =============================================================================

pub mod core;
pub mod backend;
pub mod config;
pub mod error;
