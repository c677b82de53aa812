// =============================================================================
// NESTED — Chaînage par valeur
// =============================================================================
//
// Pour un attribut chaîné par valeur, sur une ligne parent :
//
//   1. la clé de jointure = expression source de l'attribut sur la ligne
//   2. le mapping imbriqué est retrouvé par NOM (scope propre, puis liés)
//   3. un itérateur neuf est ouvert sur ce mapping avec le filtre source
//        link_field = clé   [AND filtre propre au lien]
//   4. on le vide, on le ferme (toujours, même en erreur)
//
// Mapping imbriqué dénormalisé lié par un autre champ que son identité :
// filtrer les lignes sur `link_field` couperait les groupes. On le fait en
// deux passes :
//   a. lecture des lignes link_field = clé → identités distinctes
//   b. itérateur imbriqué filtré sur identité = i1 OR identité = i2 ...
// Chaque feature rendue contient alors TOUTES les lignes de son identité.
//
// Les features rendues sont dans l'ordre de la source imbriquée. Une erreur
// de la source imbriquée fait échouer la feature parent.
//
// La profondeur est comptée : au-delà de `max_nesting_depth`, l'ouverture
// de l'itérateur imbriqué échoue en ConfigurationError.
//
// =============================================================================

use std::sync::Arc;
use tracing::trace;
use super::expression::{Predicate, SourceFilter};
use super::feature::MaterializedFeature;
use super::iterator::MappingFeatureIterator;
use super::mapping::{AttributeMapping, FeatureTypeMapping, NestedLink};
use super::query::Query;
use super::scope::MappingScope;
use super::source::{Row, SourceQuery};
use super::typeside::Value;
use crate::error::{MappingError, Result};

pub struct NestedMappingResolver<'s> {
    scope: &'s Arc<MappingScope>,
    depth: usize,
}

impl<'s> NestedMappingResolver<'s> {
    /// `depth` = profondeur de l'itérateur parent
    pub fn new(scope: &'s Arc<MappingScope>, depth: usize) -> Self {
        NestedMappingResolver { scope, depth }
    }

    /// Les features imbriquées liées à une ligne parent.
    pub fn resolve(&self, attribute: &AttributeMapping, link: &NestedLink, row: &Row) -> Result<Vec<MaterializedFeature>> {
        let key_expr = attribute.source_expression.as_ref().ok_or_else(|| {
            MappingError::configuration(format!(
                "'{}' chaîné par valeur sans clé de jointure", attribute.target_path
            ))
        })?;
        let key = self.scope.evaluator().evaluate(key_expr, row)?;
        if key.is_null() {
            return Ok(Vec::new());
        }

        let (owner, mapping) = self.scope.resolve_mapping(&link.type_name).ok_or_else(|| {
            MappingError::configuration(format!("type imbriqué '{}' introuvable", link.type_name))
        })?;

        let mut filter = Predicate::equals(link.link_field.clone(), key.clone());
        if let Some(extra) = &link.filter {
            filter = filter.and(extra.clone());
        }

        let whole_groups = mapping.denormalized
            && (link.link_field != mapping.identity_expression || link.filter.is_some());
        if whole_groups {
            let identities = matching_identities(&owner, &mapping, &filter)?;
            if identities.is_empty() {
                return Ok(Vec::new());
            }
            filter = identity_filter(&mapping, identities);
        }

        let mut nested = MappingFeatureIterator::new(owner, mapping, Query::all())
            .with_source_filter(filter)
            .at_depth(self.depth + 1);
        let result = drain(&mut nested);
        nested.close();

        if let Ok(features) = &result {
            trace!(
                attribute = %attribute.target_path,
                nested = %link.type_name,
                key = %key,
                found = features.len(),
                "chaînage par valeur"
            );
        }
        result
    }
}

/// Identités distinctes des lignes qui satisfont `filter`, dans l'ordre de lecture.
fn matching_identities(
    owner: &Arc<MappingScope>,
    mapping: &FeatureTypeMapping,
    filter: &SourceFilter,
) -> Result<Vec<Value>> {
    let source = owner.source_handle(&mapping.target_type_name)?;
    let query = SourceQuery::new(&mapping.source_type).with_filter(Some(filter.clone()));
    let mut cursor = source.open(&query)?;
    let mut identities: Vec<Value> = Vec::new();
    let result = (|| -> Result<()> {
        while let Some(row) = cursor.next_row()? {
            let identity = owner.evaluator().evaluate(&mapping.identity_expression, &row)?;
            if !identity.is_null() && !identities.iter().any(|i| i.same_identity(&identity)) {
                identities.push(identity);
            }
        }
        Ok(())
    })();
    cursor.close();
    result?;
    trace!(nested = %mapping.target_type_name, identities = identities.len(), "identités liées");
    Ok(identities)
}

fn identity_filter(mapping: &FeatureTypeMapping, identities: Vec<Value>) -> SourceFilter {
    let mut alternatives: Vec<SourceFilter> = identities.into_iter()
        .map(|id| Predicate::equals(mapping.identity_expression.clone(), id))
        .collect();
    if alternatives.len() == 1 {
        alternatives.remove(0)
    } else {
        Predicate::Or(alternatives)
    }
}

fn drain(iterator: &mut MappingFeatureIterator) -> Result<Vec<MaterializedFeature>> {
    iterator.open()?;
    let mut out = Vec::new();
    while iterator.has_next()? {
        out.push(iterator.next_feature()?);
    }
    Ok(out)
}
