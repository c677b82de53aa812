// =============================================================================
// ACCUMULATE — Des lignes d'un groupe aux propriétés d'une feature
// =============================================================================
//
// Pour CHAQUE AttributeMapping, dans l'ordre déclaré, on parcourt les lignes
// du groupe d'identité :
//
//   multiple     → une entrée par ligne contributive, dans l'ordre des lignes
//   mono-valué   → la première ligne seulement (la première gagne)
//
// Selon la nature de l'attribut, une ligne donne :
//   simple       → Simple(valeur)           (rien si la valeur est nulle)
//   référence    → Empty + xlink:href       (ReferenceResolver)
//   par valeur   → Feature(...) par feature imbriquée trouvée
//
// Le chaînage par valeur est l'exception à « une entrée par ligne » : une
// feature imbriquée n'apparaît qu'une fois par identité, même si plusieurs
// lignes du groupe portent la même clé de jointure.
//
// Les étapes intermédiaires d'un chemin cible (`a/b/c`) deviennent des
// conteneurs Complex, retrouvés par (nom, index) ou créés à la demande.
//
// =============================================================================

use std::collections::HashSet;
use super::expression::ExpressionEvaluator;
use super::feature::{MaterializedFeature, Property, PropertyValue};
use super::mapping::{AttributeMapping, NestedLink, PathStep};
use super::reference::ReferenceResolver;
use super::source::Row;
use super::typeside::Value;
use crate::error::Result;

/// Fournit les features imbriquées d'un attribut chaîné par valeur, pour une ligne.
pub type NestedFetch<'f> = dyn FnMut(&AttributeMapping, &NestedLink, &Row) -> Result<Vec<MaterializedFeature>> + 'f;

pub struct AttributeValueAccumulator<'a> {
    evaluator: &'a dyn ExpressionEvaluator,
    href_property: &'a str,
}

impl<'a> AttributeValueAccumulator<'a> {
    pub fn new(evaluator: &'a dyn ExpressionEvaluator, href_property: &'a str) -> Self {
        AttributeValueAccumulator { evaluator, href_property }
    }

    /// Ajoute à `feature` les propriétés produites par `attribute` sur le groupe.
    pub fn accumulate(
        &self,
        feature: &mut MaterializedFeature,
        attribute: &AttributeMapping,
        rows: &[Row],
        nested: &mut NestedFetch<'_>,
    ) -> Result<()> {
        let rows = if attribute.is_multiple { rows } else { &rows[..rows.len().min(1)] };
        let leaves = match &attribute.nested {
            Some(link) => self.nested_leaves(attribute, link, rows, nested)?,
            None if attribute.is_reference => {
                let resolver = ReferenceResolver::new(self.evaluator, self.href_property);
                let mut out = Vec::new();
                for row in rows {
                    out.extend(resolver.resolve(attribute, row)?);
                }
                out
            }
            None => {
                let mut out = Vec::new();
                for row in rows {
                    out.extend(self.simple_leaf(attribute, row)?);
                }
                out
            }
        };

        let containers = &attribute.target_path.steps[..attribute.target_path.steps.len() - 1];
        for leaf in leaves {
            place(feature.properties_mut(), containers, leaf);
        }
        Ok(())
    }

    fn simple_leaf(&self, attribute: &AttributeMapping, row: &Row) -> Result<Option<Property>> {
        let value = match &attribute.source_expression {
            Some(expr) => self.evaluator.evaluate(expr, row)?,
            None => Value::Null,
        };
        let mut property = Property::with_value(&attribute.target_path.leaf().name, PropertyValue::Empty);
        self.decorate(&mut property, attribute, row)?;
        if value.is_null() {
            // sans valeur ni métadonnée, la ligne ne contribue pas
            return Ok(if property.client_properties.is_empty() { None } else { Some(property) });
        }
        property.value = PropertyValue::Simple(value);
        Ok(Some(property))
    }

    fn nested_leaves(
        &self,
        attribute: &AttributeMapping,
        link: &NestedLink,
        rows: &[Row],
        nested: &mut NestedFetch<'_>,
    ) -> Result<Vec<Property>> {
        let mut seen_keys: Vec<Value> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            if let Some(key_expr) = &attribute.source_expression {
                let key = self.evaluator.evaluate(key_expr, row)?;
                if seen_keys.iter().any(|k| k.same_identity(&key)) {
                    continue;
                }
                seen_keys.push(key);
            }
            for child in nested(attribute, link, row)? {
                if let Some(id) = child.id() {
                    if !seen_ids.insert(id.to_string()) {
                        continue;
                    }
                }
                let mut property = Property::with_value(
                    &attribute.target_path.leaf().name,
                    PropertyValue::Feature(Box::new(child)),
                );
                self.decorate(&mut property, attribute, row)?;
                out.push(property);
                if !attribute.is_multiple {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Propriétés clientes déclarées + `id` de l'instance produite
    fn decorate(&self, property: &mut Property, attribute: &AttributeMapping, row: &Row) -> Result<()> {
        if let Some(expr) = &attribute.id_expression {
            let id = self.evaluator.evaluate(expr, row)?;
            if !id.is_null() {
                property.client_properties.insert("id".to_string(), Value::String(id.as_text()));
            }
        }
        for (name, expr) in &attribute.client_properties {
            let v = self.evaluator.evaluate(expr, row)?;
            if !v.is_null() {
                property.client_properties.insert(name.clone(), v);
            }
        }
        Ok(())
    }
}

/// Range `leaf` sous la chaîne de conteneurs, en créant ceux qui manquent.
fn place(props: &mut Vec<Property>, containers: &[PathStep], leaf: Property) {
    let Some((step, rest)) = containers.split_first() else {
        props.push(leaf);
        return;
    };
    let is_container = |p: &Property| p.name == step.name && matches!(p.value, PropertyValue::Complex(_));
    let wanted = step.index.unwrap_or(1).max(1);
    let mut existing = props.iter().filter(|p| is_container(p)).count();
    while existing < wanted {
        props.push(Property::with_value(&step.name, PropertyValue::Complex(Vec::new())));
        existing += 1;
    }
    let container = props.iter_mut().filter(|p| is_container(p)).nth(wanted - 1);
    if let Some(Property { value: PropertyValue::Complex(children), .. }) = container {
        place(children, rest, leaf);
    }
}
