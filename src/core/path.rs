// =============================================================================
// PATH — Résolution des chemins de propriétés vers les mappings
// =============================================================================
//
// Un chemin comme
//
//   gsml:specification/gsml:GeologicUnit/gsml:composition/gsml:CompositionPart/gsml:lithology
//
// est lu pas à pas contre les mappings :
//
//   specification   → attribut chaîné par valeur de MappedFeature  (Nested)
//   GeologicUnit    → nom du type imbriqué, étape sautée
//   composition     → attribut chaîné par valeur de GeologicUnit  (Nested)
//   CompositionPart → nom du type imbriqué, étape sautée
//   lithology       → attribut de CompositionPart
//
// Autres sortes d'étapes :
//   proportion/value   → `proportion` est une étape virtuelle (VirtualComplex)
//   occurrence/@href   → propriété cliente d'une référence (ClientProperty)
//
// Trois usages :
//   1. split()       → découpe un filtre : ce qui tient dans la source est
//                      poussé, le reste est évalué après matérialisation
//   2. values_at()   → valeurs atteintes par un chemin sur une feature
//   3. descriptor()  → nature de la propriété visée (jamais déduite du parent)
//
// Les résolutions sont mises en cache par (type racine, chemin).
//
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;
use super::expression::{Expression, Filter, Predicate, SourceFilter};
use super::feature::{MaterializedFeature, PropertyValue};
use super::mapping::{names_match, FeatureTypeMapping, PathStep};
use super::typeside::Value;
use crate::error::{MappingError, Result};

/// Retrouve un mapping par nom de type (scope propre, puis scopes liés).
pub trait MappingLookup {
    fn lookup(&self, type_name: &str) -> Option<Arc<FeatureTypeMapping>>;
}

/// Nature d'une étape résolue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopKind {
    Simple,
    VirtualComplex,
    Nested(String),
    Reference,
    ClientProperty(String),
}

impl fmt::Display for HopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopKind::Simple => write!(f, "simple"),
            HopKind::VirtualComplex => write!(f, "virtuel"),
            HopKind::Nested(t) => write!(f, "imbriqué({})", t),
            HopKind::Reference => write!(f, "référence"),
            HopKind::ClientProperty(n) => write!(f, "@{}", n),
        }
    }
}

/// Une étape résolue : dans quel type, via quels attributs.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub type_name: String,
    /// Indices des AttributeMapping concernés dans le mapping `type_name`
    pub attributes: Vec<usize>,
    pub step: PathStep,
    pub kind: HopKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub path: String,
    pub hops: Vec<Hop>,
}

impl ResolvedPath {
    pub fn terminal(&self) -> Option<&Hop> {
        self.hops.last()
    }

    /// Le chemin passe-t-il par une feature imbriquée ?
    pub fn crosses_nested(&self) -> bool {
        self.hops.iter().any(|h| matches!(h.kind, HopKind::Nested(_)))
    }

    /// Expression source équivalente, si le chemin peut être évalué par la
    /// source de `root` sans changer le résultat.
    ///
    /// Sur un mapping dénormalisé, filtrer des lignes peut amputer un groupe ;
    /// seule l'identité reste alors sûre.
    pub fn source_expression<'m>(&self, root: &'m FeatureTypeMapping) -> Option<&'m Expression> {
        let [hop] = self.hops.as_slice() else {
            return None;
        };
        let [index] = hop.attributes.as_slice() else {
            return None;
        };
        if hop.kind != HopKind::Simple || hop.type_name != root.target_type_name {
            return None;
        }
        let attribute = root.attribute_mappings.get(*index)?;
        if attribute.target_path.is_nested() || hop.step.index.is_some() {
            return None;
        }
        let expr = attribute.source_expression.as_ref()?;
        if root.denormalized && *expr != root.identity_expression {
            return None;
        }
        Some(expr)
    }
}

/// Résolveur de chemins avec cache.
pub struct PropertyPathResolver {
    href_property: String,
    cache: Mutex<HashMap<(String, String), Arc<ResolvedPath>>>,
}

impl PropertyPathResolver {
    pub fn new(href_property: &str) -> Self {
        PropertyPathResolver {
            href_property: href_property.to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Résout `path` depuis le mapping racine ; PathResolution si impossible.
    pub fn resolve(
        &self,
        path: &str,
        root: &Arc<FeatureTypeMapping>,
        lookup: &dyn MappingLookup,
    ) -> Result<Arc<ResolvedPath>> {
        let key = (root.target_type_name.clone(), path.to_string());
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(hit));
        }
        let resolved = Arc::new(self.resolve_uncached(path, root, lookup)?);
        self.cache.lock().insert(key, Arc::clone(&resolved));
        Ok(resolved)
    }

    /// Nombre de chemins en cache
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    fn resolve_uncached(
        &self,
        path: &str,
        root: &Arc<FeatureTypeMapping>,
        lookup: &dyn MappingLookup,
    ) -> Result<ResolvedPath> {
        let fail = |reason: String| MappingError::path_resolution(path, reason);
        let raw_steps: Vec<&str> = path.split('/').map(str::trim).collect();
        if raw_steps.iter().any(|s| s.is_empty()) {
            return Err(fail("étape vide".to_string()));
        }

        let mut mapping = Arc::clone(root);
        // mapping qui porte l'attribut de la dernière étape
        let mut owner = Arc::clone(root);
        let mut candidates: Vec<usize> = (0..mapping.attribute_mappings.len()).collect();
        let mut depth = 0;
        let mut after_nested = false;
        let mut at_leaf = false;
        let mut hops: Vec<Hop> = Vec::new();

        for (i, raw) in raw_steps.iter().enumerate() {
            if let Some(name) = raw.strip_prefix('@') {
                if i + 1 != raw_steps.len() {
                    return Err(fail(format!("'@{}' doit terminer le chemin", name)));
                }
                let Some(prev) = hops.last() else {
                    return Err(fail(format!("'@{}' sans propriété porteuse", name)));
                };
                let (type_name, attributes) = (prev.type_name.clone(), prev.attributes.clone());
                if !self.declares_client_property(&owner, &attributes, name) {
                    return Err(fail(format!("propriété cliente '{}' non déclarée", name)));
                }
                hops.push(Hop {
                    type_name,
                    attributes,
                    step: PathStep::parse(raw),
                    kind: HopKind::ClientProperty(name.to_string()),
                });
                continue;
            }

            let step = PathStep::parse(raw);
            if after_nested {
                after_nested = false;
                if names_match(&mapping.target_type_name, &step.name) {
                    continue;
                }
            }
            if at_leaf {
                return Err(fail(format!("'{}' suit une propriété sans sous-propriétés", step)));
            }

            let matched: Vec<usize> = candidates.iter().copied()
                .filter(|&idx| {
                    mapping.attribute_mappings[idx].target_path.steps.get(depth)
                        .map(|declared| {
                            declared.matches_name(&step.name)
                                && match (declared.index, step.index) {
                                    (Some(d), Some(r)) => d == r,
                                    _ => true,
                                }
                        })
                        .unwrap_or(false)
                })
                .collect();
            if matched.is_empty() {
                return Err(fail(format!("aucun attribut '{}' dans {}", step, mapping.target_type_name)));
            }

            owner = Arc::clone(&mapping);
            let deeper: Vec<usize> = matched.iter().copied()
                .filter(|&idx| mapping.attribute_mappings[idx].target_path.steps.len() > depth + 1)
                .collect();
            if !deeper.is_empty() {
                hops.push(Hop {
                    type_name: mapping.target_type_name.clone(),
                    attributes: deeper.clone(),
                    step,
                    kind: HopKind::VirtualComplex,
                });
                candidates = deeper;
                depth += 1;
                continue;
            }

            let first = &mapping.attribute_mappings[matched[0]];
            let kind = match (&first.nested, first.is_reference) {
                (Some(link), _) => HopKind::Nested(link.type_name.clone()),
                (None, true) => HopKind::Reference,
                (None, false) => HopKind::Simple,
            };
            hops.push(Hop {
                type_name: mapping.target_type_name.clone(),
                attributes: matched,
                step,
                kind: kind.clone(),
            });

            match kind {
                HopKind::Nested(type_name) => {
                    mapping = lookup.lookup(&type_name).ok_or_else(|| {
                        fail(format!("type imbriqué '{}' introuvable", type_name))
                    })?;
                    candidates = (0..mapping.attribute_mappings.len()).collect();
                    depth = 0;
                    after_nested = true;
                }
                _ => at_leaf = true,
            }
        }

        if hops.is_empty() {
            return Err(fail("aucune propriété désignée".to_string()));
        }
        Ok(ResolvedPath { path: path.to_string(), hops })
    }

    fn declares_client_property(&self, owner: &FeatureTypeMapping, attributes: &[usize], name: &str) -> bool {
        attributes.iter()
            .filter_map(|idx| owner.attribute_mappings.get(*idx))
            .any(|a| {
                (a.is_reference && names_match(&self.href_property, name))
                    || (a.id_expression.is_some() && names_match("id", name))
                    || a.client_properties.iter().any(|(n, _)| names_match(n, name))
            })
    }

    /// Découpe un filtre en (partie poussée vers la source, partie résiduelle).
    ///
    /// Chaque conjoint est poussé en entier ou pas du tout. Tous les chemins
    /// sont résolus d'abord : un chemin invalide échoue ici, avant toute lecture.
    pub fn split(
        &self,
        filter: &Filter,
        root: &Arc<FeatureTypeMapping>,
        lookup: &dyn MappingLookup,
    ) -> Result<(Option<SourceFilter>, Option<Filter>)> {
        for operand in filter.operands() {
            self.resolve(operand, root, lookup)?;
        }

        let conjuncts: Vec<Filter> = match filter {
            Predicate::Include => Vec::new(),
            Predicate::And(parts) => parts.clone(),
            other => vec![other.clone()],
        };

        let mut pushed = Predicate::Include;
        let mut residual = Predicate::Include;
        for conjunct in conjuncts {
            let rewritten = conjunct.try_map(&mut |path: &String| -> std::result::Result<Expression, ()> {
                let resolved = self.resolve(path, root, lookup).map_err(|_| ())?;
                resolved.source_expression(root).cloned().ok_or(())
            });
            match rewritten {
                Ok(source) => pushed = pushed.and(source),
                Err(()) => residual = residual.and(conjunct),
            }
        }

        Ok((non_trivial(pushed), non_trivial(residual)))
    }

    /// Nature de la propriété désignée par un chemin
    pub fn descriptor(
        &self,
        path: &str,
        root: &Arc<FeatureTypeMapping>,
        lookup: &dyn MappingLookup,
    ) -> Result<HopKind> {
        let resolved = self.resolve(path, root, lookup)?;
        resolved.terminal()
            .map(|h| h.kind.clone())
            .ok_or_else(|| MappingError::path_resolution(path, "chemin vide"))
    }
}

impl fmt::Debug for PropertyPathResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyPathResolver")
            .field("href_property", &self.href_property)
            .field("cached", &self.cached())
            .finish()
    }
}

fn non_trivial<A>(p: Predicate<A>) -> Option<Predicate<A>> {
    if matches!(p, Predicate::Include) { None } else { Some(p) }
}

/// Toutes les valeurs atteintes par un chemin sur une feature matérialisée.
///
/// Une feature imbriquée vaut son identifiant ; une valeur vide ne compte pas.
pub fn values_at(feature: &MaterializedFeature, path: &str) -> Vec<Value> {
    let (prefix, client) = match path.rsplit_once('/') {
        Some((prefix, last)) if last.trim().starts_with('@') => (prefix, Some(&last.trim()[1..])),
        _ => (path, None),
    };
    let properties = feature.find_all(prefix);
    match client {
        Some(name) => properties.iter()
            .filter_map(|p| p.client_property(name).cloned())
            .collect(),
        None => properties.iter()
            .filter_map(|p| match &p.value {
                PropertyValue::Simple(v) if !v.is_null() => Some(v.clone()),
                PropertyValue::Feature(f) => f.id().map(|id| Value::from(id)),
                _ => None,
            })
            .collect(),
    }
}
