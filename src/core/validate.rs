// =============================================================================
// VALIDATE — Vérification d'un ensemble de mappings au chargement
// =============================================================================
//
// Ce module vérifie qu'un scope est cohérent AVANT toute lecture :
//   - pas deux mappings pour le même type cible
//   - des chemins cibles bien formés (pas d'étape vide, pas d'index [0])
//   - un attribut est chaîné par valeur OU par référence, pas les deux
//   - tout type imbriqué existe (dans le scope ou un scope lié)
//   - pas de cycle de chaînage PAR VALEUR
//
// Les références ne lisent rien : A → B par valeur et B → A par référence
// est légal. A → B → A par valeur ne terminerait jamais.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use super::mapping::{names_match, FeatureTypeMapping};
use super::path::MappingLookup;
use super::scope::MappingScope;

/// Erreur de validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.message)
    }
}

fn error(message: String) -> ValidationError {
    ValidationError { message }
}

/// Vérifie un ensemble de mappings chargés ensemble.
pub fn validate_scope(mappings: &[FeatureTypeMapping], linked: &[Arc<MappingScope>]) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for m in mappings {
        if !seen.insert(m.target_type_name.as_str()) {
            errors.push(error(format!("type cible '{}' déclaré deux fois", m.target_type_name)));
        }
    }

    for m in mappings {
        errors.extend(validate_mapping(m));
        for link in m.attribute_mappings.iter().filter_map(|a| a.nested.as_ref()) {
            let local = mappings.iter().any(|other| names_match(&other.target_type_name, &link.type_name));
            let remote = linked.iter().any(|scope| scope.lookup(&link.type_name).is_some());
            if !local && !remote {
                errors.push(error(format!(
                    "{} : type imbriqué '{}' introuvable", m.target_type_name, link.type_name
                )));
            }
        }
    }

    if let Some(cycle) = find_by_value_cycle(mappings) {
        errors.push(error(format!("cycle de chaînage par valeur : {}", cycle.join(" → "))));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Vérifie les attributs d'un mapping isolé.
pub fn validate_mapping(mapping: &FeatureTypeMapping) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let type_name = &mapping.target_type_name;

    for a in &mapping.attribute_mappings {
        let path = &a.target_path;
        for step in &path.steps {
            if step.name.is_empty() {
                errors.push(error(format!("{} : chemin cible '{}' avec une étape vide", type_name, path)));
            } else if step.name.contains('[') || step.name.contains(']') {
                errors.push(error(format!("{} : index illisible dans '{}'", type_name, step.name)));
            }
            if step.index == Some(0) {
                errors.push(error(format!("{} : index [0] dans '{}' (les index commencent à 1)", type_name, path)));
            }
        }
        if a.nested.is_some() && a.is_reference {
            errors.push(error(format!("{} : '{}' chaîné à la fois par valeur et par référence", type_name, path)));
        }
        if a.nested.is_some() && a.source_expression.is_none() {
            errors.push(error(format!("{} : '{}' chaîné par valeur sans clé de jointure", type_name, path)));
        }
        if a.is_reference {
            let has_link = a.reference.as_ref().and_then(|r| r.link_expression.as_ref()).is_some();
            if !has_link && a.source_expression.is_none() {
                errors.push(error(format!("{} : référence '{}' sans expression de liaison", type_name, path)));
            }
        }
    }
    errors
}

/// Cherche un cycle parmi les liens par valeur (DFS, visités / pile).
fn find_by_value_cycle(mappings: &[FeatureTypeMapping]) -> Option<Vec<String>> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for m in mappings {
        let targets = edges.entry(m.target_type_name.as_str()).or_default();
        for nested in m.nested_types() {
            if let Some(target) = mappings.iter().find(|t| names_match(&t.target_type_name, nested)) {
                targets.push(target.target_type_name.as_str());
            }
        }
    }

    fn dfs<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }
        stack.push(node);
        for next in edges.get(node).into_iter().flatten() {
            if let Some(cycle) = dfs(next, edges, visited, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }

    let mut visited = HashSet::new();
    for m in mappings {
        let mut stack = Vec::new();
        if let Some(cycle) = dfs(&m.target_type_name, &edges, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}
