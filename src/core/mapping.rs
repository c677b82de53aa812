// =============================================================================
// MAPPING — Description immuable d'un type cible
// =============================================================================
//
// Un FeatureTypeMapping décrit COMMENT fabriquer les features d'un type cible
// à partir des lignes d'une source tabulaire :
//   - l'expression d'identité (regroupe les lignes en une feature logique)
//   - la liste ORDONNÉE des AttributeMapping (l'ordre de sortie des propriétés)
//   - le descripteur de source (consommé par le SourceRegistry)
//
// Chaque AttributeMapping envoie une expression source vers un CHEMIN CIBLE
// qualifié, éventuellement imbriqué :
//
//   gml:name                         → propriété simple
//   gsml:proportion/gsml:value       → propriété « virtuelle » imbriquée,
//                                      sans colonne physique pour le parent
//   FEATURE_LINK[2]                  → deuxième occurrence d'un même nom
//
// CHAÎNAGE :
//   Par valeur     → `nested` : on matérialise un autre type (par son NOM)
//   Par référence  → `reference` : propriété vide + pointeur (xlink:href)
//
// On référence les types imbriqués par NOM et non par lien direct : les
// références mutuelles restent représentables sans graphe de possession
// cyclique. Les cycles par valeur sont rejetés au chargement (validate).
//
// EXEMPLE :
//   MappedFeature --specification (par valeur)--> GeologicUnit
//   GeologicUnit  --occurrence (par référence)--> MappedFeature
//
// =============================================================================

use std::fmt;
use super::expression::{Expression, SourceFilter};
use super::source::SourceDescriptor;

/// Une étape d'un chemin cible : nom qualifié (`préfixe:local`) + index optionnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathStep {
    pub name: String,
    /// Index 1-based (`nom[2]`), None si absent
    pub index: Option<usize>,
}

impl PathStep {
    /// Lit `nom` ou `nom[n]`. Un index illisible reste dans le nom, ce que la
    /// validation signale ensuite.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(open) = raw.find('[') {
            if raw.ends_with(']') {
                if let Ok(n) = raw[open + 1..raw.len() - 1].trim().parse::<usize>() {
                    return PathStep {
                        name: raw[..open].to_string(),
                        index: Some(n),
                    };
                }
            }
        }
        PathStep { name: raw.to_string(), index: None }
    }

    /// Partie locale d'un nom qualifié (`gsml:name` → `name`)
    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    /// Le nom demandé désigne-t-il cette étape ?
    ///
    /// Un nom non qualifié correspond à toute étape de même partie locale.
    pub fn matches_name(&self, requested: &str) -> bool {
        names_match(&self.name, requested)
    }
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.name, i),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Partie locale d'un nom qualifié
pub fn local_part(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Égalité de noms : exacte, ou par partie locale si l'un des deux n'est pas qualifié.
pub fn names_match(declared: &str, requested: &str) -> bool {
    if declared == requested {
        return true;
    }
    let qualified = |n: &str| n.contains(':');
    if !qualified(requested) || !qualified(declared) {
        return local_part(declared) == local_part(requested);
    }
    false
}

/// Chemin cible complet d'un attribut (`a/b/c`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetPath {
    pub steps: Vec<PathStep>,
}

impl TargetPath {
    pub fn parse(raw: &str) -> Self {
        TargetPath {
            steps: raw.split('/').map(PathStep::parse).collect(),
        }
    }

    /// Première étape = nom de la propriété de premier niveau
    pub fn head(&self) -> &PathStep {
        &self.steps[0]
    }

    /// Dernière étape = la propriété qui reçoit la valeur
    pub fn leaf(&self) -> &PathStep {
        &self.steps[self.steps.len() - 1]
    }

    /// Le chemin traverse-t-il des étapes virtuelles (sans colonne) ?
    pub fn is_nested(&self) -> bool {
        self.steps.len() > 1
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", steps.join("/"))
    }
}

/// Chaînage par valeur : quel type matérialiser, et comment joindre.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedLink {
    /// Nom du type cible imbriqué (résolu via le scope, jamais par pointeur)
    pub type_name: String,
    /// Expression du mapping imbriqué comparée à la clé de jointure
    pub link_field: Expression,
    /// Filtre supplémentaire appliqué côté imbriqué
    pub filter: Option<SourceFilter>,
}

/// Chaînage par référence : gabarit du pointeur + expression de liaison.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSpec {
    /// Gabarit, `{}` remplacé par la valeur liée (sinon concaténée à la fin)
    pub template: String,
    /// Expression liée ; à défaut, l'expression source de l'attribut
    pub link_expression: Option<Expression>,
}

/// Correspondance d'un attribut cible.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeMapping {
    pub target_path: TargetPath,
    /// Expression source ; pour un attribut chaîné par valeur, c'est la clé de jointure
    pub source_expression: Option<Expression>,
    pub is_multiple: bool,
    pub is_reference: bool,
    /// Identifiant de l'instance produite (propriété cliente `id`)
    pub id_expression: Option<Expression>,
    /// Propriétés clientes : nom → expression
    pub client_properties: Vec<(String, Expression)>,
    pub nested: Option<NestedLink>,
    pub reference: Option<ReferenceSpec>,
}

impl AttributeMapping {
    /// Attribut simple `target ← expr`
    pub fn simple(target: &str, expr: Expression) -> Self {
        AttributeMapping {
            target_path: TargetPath::parse(target),
            source_expression: Some(expr),
            is_multiple: false,
            is_reference: false,
            id_expression: None,
            client_properties: Vec::new(),
            nested: None,
            reference: None,
        }
    }

    /// Chaînage par valeur : `join_key` évalué sur la ligne parent est comparé
    /// à `link_field` dans le mapping `type_name`.
    pub fn nested(target: &str, join_key: Expression, type_name: &str, link_field: Expression) -> Self {
        let mut m = AttributeMapping::simple(target, join_key);
        m.nested = Some(NestedLink {
            type_name: type_name.to_string(),
            link_field,
            filter: None,
        });
        m
    }

    /// Chaînage par référence : aucune lecture imbriquée, juste un pointeur.
    pub fn reference(target: &str, link: Expression, template: &str) -> Self {
        let mut m = AttributeMapping::simple(target, link);
        m.is_reference = true;
        m.reference = Some(ReferenceSpec {
            template: template.to_string(),
            link_expression: None,
        });
        m
    }

    pub fn multiple(mut self) -> Self {
        self.is_multiple = true;
        self
    }

    pub fn with_id(mut self, expr: Expression) -> Self {
        self.id_expression = Some(expr);
        self
    }

    pub fn with_client_property(mut self, name: &str, expr: Expression) -> Self {
        self.client_properties.push((name.to_string(), expr));
        self
    }

    /// Filtre additionnel côté imbriqué (sans effet hors chaînage par valeur)
    pub fn with_nested_filter(mut self, filter: SourceFilter) -> Self {
        if let Some(link) = &mut self.nested {
            link.filter = Some(filter);
        }
        self
    }

    /// Expression de liaison d'une référence
    pub fn with_link_expression(mut self, expr: Expression) -> Self {
        if let Some(spec) = &mut self.reference {
            spec.link_expression = Some(expr);
        }
        self
    }

    pub fn is_nested(&self) -> bool {
        self.nested.is_some()
    }
}

/// Le mapping complet d'un type cible.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTypeMapping {
    pub target_type_name: String,
    pub identity_expression: Expression,
    /// Ordre = ordre des propriétés en sortie
    pub attribute_mappings: Vec<AttributeMapping>,
    pub source: SourceDescriptor,
    /// Nom du type source (table, couche...) dans la source partagée
    pub source_type: String,
    /// Une feature logique peut s'étaler sur plusieurs lignes physiques
    pub denormalized: bool,
}

impl FeatureTypeMapping {
    pub fn new(type_name: &str, source_type: &str, identity: Expression, source: SourceDescriptor) -> Self {
        FeatureTypeMapping {
            target_type_name: type_name.to_string(),
            identity_expression: identity,
            attribute_mappings: Vec::new(),
            source,
            source_type: source_type.to_string(),
            denormalized: false,
        }
    }

    pub fn denormalized(&mut self, value: bool) -> &mut Self {
        self.denormalized = value;
        self
    }

    /// Ajoute un attribut (l'ordre d'ajout est l'ordre de sortie)
    pub fn add(&mut self, attribute: AttributeMapping) -> &mut Self {
        self.attribute_mappings.push(attribute);
        self
    }

    /// Raccourci : attribut simple mono-valué
    pub fn map_attr(&mut self, target: &str, expr: Expression) -> &mut Self {
        self.add(AttributeMapping::simple(target, expr))
    }

    /// Raccourci : attribut simple multivalué
    pub fn map_multi(&mut self, target: &str, expr: Expression) -> &mut Self {
        self.add(AttributeMapping::simple(target, expr).multiple())
    }

    /// Les types atteints par chaînage par valeur
    pub fn nested_types(&self) -> Vec<&str> {
        self.attribute_mappings.iter()
            .filter_map(|a| a.nested.as_ref())
            .map(|n| n.type_name.as_str())
            .collect()
    }
}

impl fmt::Display for FeatureTypeMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mapping {} : {}.{} = {{", self.target_type_name, self.source.kind, self.source_type)?;
        writeln!(f, "  id <- {}", self.identity_expression)?;
        for a in &self.attribute_mappings {
            let arrow = if a.is_multiple { "<-*" } else { "<-" };
            let expr = a.source_expression.as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "-".to_string());
            match (&a.nested, &a.reference) {
                (Some(n), _) => writeln!(f, "  {} {} {} => {}[{}]", a.target_path, arrow, expr, n.type_name, n.link_field)?,
                (_, Some(r)) => writeln!(f, "  {} {} {} => ref '{}'", a.target_path, arrow, expr, r.template)?,
                _ => writeln!(f, "  {} {} {}", a.target_path, arrow, expr)?,
            }
        }
        write!(f, "}}")
    }
}
