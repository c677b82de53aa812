// =============================================================================
// REFERENCE — Chaînage par référence
// =============================================================================
//
// Une propriété chaînée par référence ne matérialise RIEN : elle porte une
// valeur vide et un pointeur dans ses propriétés clientes.
//
//   MF_ID = "mf2"   +   gabarit "urn:cgi:feature:MappedFeature:{}"
//     → gsml:occurrence ∅ {xlink:href = "urn:cgi:feature:MappedFeature:mf2"}
//
// Aucune source n'est ouverte : deux types qui se référencent mutuellement
// ne peuvent donc pas boucler.
//
// =============================================================================

use super::expression::ExpressionEvaluator;
use super::feature::{Property, PropertyValue};
use super::mapping::{AttributeMapping, ReferenceSpec};
use super::source::Row;
use super::typeside::Value;
use crate::error::{MappingError, Result};

/// Remplace `{}` par la valeur ; sans marqueur, la valeur est ajoutée à la fin.
pub fn render_reference(template: &str, value: &Value) -> String {
    let text = value.as_text();
    if template.contains("{}") {
        template.replacen("{}", &text, 1)
    } else {
        format!("{}{}", template, text)
    }
}

/// Produit la propriété-pointeur d'un attribut `is_reference`.
pub struct ReferenceResolver<'a> {
    evaluator: &'a dyn ExpressionEvaluator,
    href_property: &'a str,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(evaluator: &'a dyn ExpressionEvaluator, href_property: &'a str) -> Self {
        ReferenceResolver { evaluator, href_property }
    }

    /// La propriété issue d'une ligne ; None si la valeur liée est nulle.
    pub fn resolve(&self, attribute: &AttributeMapping, row: &Row) -> Result<Option<Property>> {
        let default_spec;
        let spec = match &attribute.reference {
            Some(spec) => spec,
            None => {
                default_spec = ReferenceSpec { template: "{}".to_string(), link_expression: None };
                &default_spec
            }
        };
        let link = spec.link_expression.as_ref()
            .or(attribute.source_expression.as_ref())
            .ok_or_else(|| MappingError::configuration(format!(
                "référence '{}' sans expression de liaison", attribute.target_path
            )))?;

        let value = self.evaluator.evaluate(link, row)?;
        if value.is_null() {
            return Ok(None);
        }

        let mut property = Property::with_value(&attribute.target_path.leaf().name, PropertyValue::Empty);
        property.client_properties.insert(
            self.href_property.to_string(),
            Value::String(render_reference(&spec.template, &value)),
        );
        for (name, expr) in &attribute.client_properties {
            let v = self.evaluator.evaluate(expr, row)?;
            if !v.is_null() {
                property.client_properties.insert(name.clone(), v);
            }
        }
        Ok(Some(property))
    }
}
