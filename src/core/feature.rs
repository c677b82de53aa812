// =============================================================================
// FEATURE — Les features complexes matérialisées (arbres)
// =============================================================================
//
// Une MaterializedFeature est un ARBRE :
//
//   GeologicUnit gu.25678
//     gml:name = "Yaugher Volcanic Group 1"
//     gml:name = "Yaugher Volcanic Group 2"
//     gml:name = "-Py"
//     gsml:composition → CompositionPart cp.1        (chaînage par valeur)
//     gsml:composition → CompositionPart cp.2
//     gsml:occurrence  ∅ {xlink:href=urn:...:mf2}    (chaînage par référence)
//
// Une propriété porte l'une de ces valeurs :
//   Simple(Value)    → valeur typée
//   Feature(...)     → feature imbriquée, matérialisée par un autre mapping
//   Complex(...)     → étape virtuelle d'un chemin cible (pas de colonne)
//   Empty            → valeur vide, seules les propriétés clientes comptent
//
// Les features sont recréées à chaque itération : deux parents qui pointent
// vers la même identité imbriquée reçoivent deux arbres distincts.
//
// =============================================================================

use std::collections::BTreeMap;
use std::fmt;
use super::mapping::{names_match, PathStep};
use super::typeside::Value;

/// Valeur d'une propriété
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Simple(Value),
    Feature(Box<MaterializedFeature>),
    Complex(Vec<Property>),
    Empty,
}

/// Une propriété nommée d'une feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
    /// Métadonnées hors schéma (pointeur xlink:href, id...)
    pub client_properties: BTreeMap<String, Value>,
}

impl Property {
    pub fn simple(name: &str, value: Value) -> Self {
        Property::with_value(name, PropertyValue::Simple(value))
    }

    pub fn with_value(name: &str, value: PropertyValue) -> Self {
        Property {
            name: name.to_string(),
            value,
            client_properties: BTreeMap::new(),
        }
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn client_properties(&self) -> &BTreeMap<String, Value> {
        &self.client_properties
    }

    pub fn client_property(&self, name: &str) -> Option<&Value> {
        self.client_properties.iter()
            .find(|(k, _)| names_match(k, name))
            .map(|(_, v)| v)
    }

    /// La valeur simple, si c'en est une
    pub fn simple_value(&self) -> Option<&Value> {
        match &self.value {
            PropertyValue::Simple(v) => Some(v),
            _ => None,
        }
    }

    /// Les features imbriquées portées par cette propriété (0 ou 1)
    pub fn nested_features(&self) -> Vec<&MaterializedFeature> {
        match &self.value {
            PropertyValue::Feature(f) => vec![f.as_ref()],
            _ => vec![],
        }
    }

    /// Les sous-propriétés (étape virtuelle ou feature imbriquée)
    pub fn children(&self) -> &[Property] {
        match &self.value {
            PropertyValue::Complex(children) => children,
            PropertyValue::Feature(f) => f.properties(),
            _ => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.value, PropertyValue::Empty)
    }
}

/// Une feature complexe matérialisée.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedFeature {
    pub type_name: String,
    pub id: Option<String>,
    properties: Vec<Property>,
}

impl MaterializedFeature {
    pub fn new(type_name: &str, id: Option<String>) -> Self {
        MaterializedFeature {
            type_name: type_name.to_string(),
            id,
            properties: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Toutes les propriétés, dans l'ordre des AttributeMapping
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub(crate) fn properties_mut(&mut self) -> &mut Vec<Property> {
        &mut self.properties
    }

    pub fn push(&mut self, property: Property) {
        self.properties.push(property);
    }

    /// Les propriétés de premier niveau portant ce nom (qualifié ou local)
    pub fn get_properties(&self, name: &str) -> Vec<&Property> {
        self.properties.iter().filter(|p| names_match(&p.name, name)).collect()
    }

    /// Première propriété atteinte par un chemin `a/b/c`.
    ///
    /// Après une feature imbriquée, une étape égale à son nom de type est sautée
    /// (`specification/GeologicUnit/description`).
    pub fn get_property(&self, path: &str) -> Option<&Property> {
        self.find_all(path).into_iter().next()
    }

    /// Toutes les propriétés atteintes par un chemin, dans l'ordre
    pub fn find_all(&self, path: &str) -> Vec<&Property> {
        let steps: Vec<PathStep> = path.split('/').map(PathStep::parse).collect();
        let mut out = Vec::new();
        walk(&self.properties, &steps, &mut out);
        out
    }

    /// Garde uniquement les propriétés de premier niveau demandées
    pub fn retain_properties(&mut self, names: &[String]) {
        self.properties.retain(|p| names.iter().any(|n| names_match(&p.name, n)));
    }
}

fn walk<'a>(props: &'a [Property], steps: &[PathStep], out: &mut Vec<&'a Property>) {
    let Some((step, rest)) = steps.split_first() else {
        return;
    };
    let matching: Vec<&Property> = props.iter().filter(|p| names_match(&p.name, &step.name)).collect();
    let selected: Vec<&Property> = match step.index {
        Some(i) => matching.get(i.saturating_sub(1)).copied().into_iter().collect(),
        None => matching,
    };
    for p in selected {
        let mut rest = rest;
        if let PropertyValue::Feature(f) = &p.value {
            if let Some(first) = rest.first() {
                if names_match(&f.type_name, &first.name) {
                    rest = &rest[1..];
                }
            }
        }
        if rest.is_empty() {
            out.push(p);
        } else {
            walk(p.children(), rest, out);
        }
    }
}

impl fmt::Display for MaterializedFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_feature(f, self, 0)
    }
}

fn write_feature(f: &mut fmt::Formatter<'_>, feature: &MaterializedFeature, depth: usize) -> fmt::Result {
    writeln!(f, "{}{} {}", "  ".repeat(depth), feature.type_name, feature.id().unwrap_or("-"))?;
    write_properties(f, &feature.properties, depth + 1)
}

fn write_properties(f: &mut fmt::Formatter<'_>, props: &[Property], depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    for p in props {
        let client = if p.client_properties.is_empty() {
            String::new()
        } else {
            let parts: Vec<String> = p.client_properties.iter()
                .map(|(k, v)| format!("{}={}", k, v.as_text()))
                .collect();
            format!(" {{{}}}", parts.join(", "))
        };
        match &p.value {
            PropertyValue::Simple(v) => writeln!(f, "{}{} = {}{}", pad, p.name, v, client)?,
            PropertyValue::Empty => writeln!(f, "{}{} ∅{}", pad, p.name, client)?,
            PropertyValue::Complex(children) => {
                writeln!(f, "{}{}{}", pad, p.name, client)?;
                write_properties(f, children, depth + 1)?;
            }
            PropertyValue::Feature(nested) => {
                writeln!(f, "{}{} →{}", pad, p.name, client)?;
                write_feature(f, nested, depth + 1)?;
            }
        }
    }
    Ok(())
}
