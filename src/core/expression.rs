// =============================================================================
// EXPRESSION — Expressions source et prédicats
// =============================================================================
//
// Deux mondes se croisent ici :
//   - les EXPRESSIONS SOURCE : colonnes, littéraux, concaténations, fonctions,
//     évaluées sur une ligne tabulaire ;
//   - les PRÉDICATS : arbres AND / OR / NOT de comparaisons.
//
// Un prédicat est générique sur ses opérandes :
//   Predicate<String>     = Filter       → opérandes = chemins de propriétés
//   Predicate<Expression> = SourceFilter → opérandes = expressions source
//
// La réécriture d'un Filter en SourceFilter (push-down) est donc un simple
// `try_map` des opérandes, fait par le PropertyPathResolver.
//
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::cmp::Ordering;
use std::sync::LazyLock;
use parking_lot::Mutex;
use regex::Regex;
use super::source::Row;
use super::typeside::Value;
use crate::error::{MappingError, Result};

/// Expression évaluée sur une ligne source.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Valeur d'une colonne de la ligne
    Column(String),
    /// Constante
    Literal(Value),
    /// Concaténation textuelle ; Null si une des parties est Null
    Concat(Vec<Expression>),
    /// Appel de fonction (strConcat, strToUpperCase, strToLowerCase, strTrim)
    Function { name: String, args: Vec<Expression> },
}

impl Expression {
    pub fn column(name: &str) -> Self {
        Expression::Column(name.to_string())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn function(name: &str, args: Vec<Expression>) -> Self {
        Expression::Function { name: name.to_string(), args }
    }

    /// Les colonnes lues par cette expression
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Expression::Column(c) => vec![c.as_str()],
            Expression::Literal(_) => vec![],
            Expression::Concat(parts) | Expression::Function { args: parts, .. } => {
                parts.iter().flat_map(|p| p.columns()).collect()
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Column(c) => write!(f, "{}", c),
            Expression::Literal(v) => write!(f, "{}", v),
            Expression::Concat(parts) => {
                let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", parts.join(" || "))
            }
            Expression::Function { name, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, args.join(", "))
            }
        }
    }
}

/// Opérateur de comparaison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,      // =
    Neq,     // !=
    Lt,      // <
    Gt,      // >
    Lte,     // <=
    Gte,     // >=
}

impl fmt::Display for CompOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompOp::Eq => write!(f, "="),
            CompOp::Neq => write!(f, "!="),
            CompOp::Lt => write!(f, "<"),
            CompOp::Gt => write!(f, ">"),
            CompOp::Lte => write!(f, "<="),
            CompOp::Gte => write!(f, ">="),
        }
    }
}

/// Compare deux Values avec un opérateur.
///
/// Une comparaison avec NULL est toujours fausse, `!=` compris (sémantique
/// SQL) ; des types incompatibles donnent faux.
pub fn compare_values(lhs: &Value, op: CompOp, rhs: &Value) -> bool {
    let comparable = matches!(
        (lhs, rhs),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_))
            | (Value::String(_), Value::String(_))
            | (Value::Boolean(_), Value::Boolean(_))
    );
    if !comparable {
        return false;
    }
    let ord = lhs.total_cmp(rhs);
    match op {
        CompOp::Eq => ord == Ordering::Equal,
        CompOp::Neq => ord != Ordering::Equal,
        CompOp::Lt => ord == Ordering::Less,
        CompOp::Gt => ord == Ordering::Greater,
        CompOp::Lte => ord != Ordering::Greater,
        CompOp::Gte => ord != Ordering::Less,
    }
}

/// Motifs LIKE déjà compilés, partagés par toutes les évaluations
static LIKE_PATTERNS: LazyLock<Mutex<HashMap<String, Regex>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

const LIKE_PATTERNS_MAX: usize = 256;

/// `like_to_regex` avec cache : un motif n'est compilé qu'une fois.
pub fn cached_like_regex(pattern: &str) -> Result<Regex> {
    if let Some(re) = LIKE_PATTERNS.lock().get(pattern) {
        return Ok(re.clone());
    }
    let re = like_to_regex(pattern)?;
    let mut cache = LIKE_PATTERNS.lock();
    if cache.len() >= LIKE_PATTERNS_MAX {
        cache.clear();
    }
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Traduit un motif LIKE (`*` = n caractères, `.` = un caractère, `!` = échappement)
/// en expression régulière ancrée.
pub fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^(?s)");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '!' => {
                if let Some(escaped) = chars.next() {
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            '*' => re.push_str(".*"),
            '.' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| MappingError::evaluation(format!(
        "motif LIKE invalide '{}' : {}", pattern, e
    )))
}

/// Arbre de prédicat générique sur ses opérandes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate<A> {
    /// Toujours vrai
    Include,
    /// Toujours faux
    Exclude,
    And(Vec<Predicate<A>>),
    Or(Vec<Predicate<A>>),
    Not(Box<Predicate<A>>),
    Compare { operand: A, op: CompOp, value: Value },
    Like { operand: A, pattern: String },
    IsNull(A),
}

/// Filtre exprimé sur des chemins de propriétés (surface de requête)
pub type Filter = Predicate<String>;

/// Filtre exprimé en termes de la source (poussé vers la requête tabulaire)
pub type SourceFilter = Predicate<Expression>;

impl<A> Predicate<A> {
    pub fn compare(operand: A, op: CompOp, value: impl Into<Value>) -> Self {
        Predicate::Compare { operand, op, value: value.into() }
    }

    pub fn equals(operand: A, value: impl Into<Value>) -> Self {
        Predicate::compare(operand, CompOp::Eq, value)
    }

    pub fn like(operand: A, pattern: &str) -> Self {
        Predicate::Like { operand, pattern: pattern.to_string() }
    }

    /// Conjonction, en aplatissant les AND imbriqués et en absorbant Include.
    pub fn and(self, other: Predicate<A>) -> Self {
        let mut parts = Vec::new();
        for p in [self, other] {
            match p {
                Predicate::Include => {}
                Predicate::And(inner) => parts.extend(inner),
                p => parts.push(p),
            }
        }
        match parts.len() {
            0 => Predicate::Include,
            1 => parts.pop().unwrap_or(Predicate::Include),
            _ => Predicate::And(parts),
        }
    }

    /// Tous les opérandes du prédicat
    pub fn operands(&self) -> Vec<&A> {
        match self {
            Predicate::Include | Predicate::Exclude => vec![],
            Predicate::And(ps) | Predicate::Or(ps) => ps.iter().flat_map(|p| p.operands()).collect(),
            Predicate::Not(p) => p.operands(),
            Predicate::Compare { operand, .. }
            | Predicate::Like { operand, .. }
            | Predicate::IsNull(operand) => vec![operand],
        }
    }

    /// Réécrit chaque opérande ; échoue dès qu'un opérande ne se traduit pas.
    pub fn try_map<B, E>(&self, f: &mut impl FnMut(&A) -> std::result::Result<B, E>) -> std::result::Result<Predicate<B>, E> {
        Ok(match self {
            Predicate::Include => Predicate::Include,
            Predicate::Exclude => Predicate::Exclude,
            Predicate::And(ps) => Predicate::And(
                ps.iter().map(|p| p.try_map(&mut *f)).collect::<std::result::Result<_, _>>()?,
            ),
            Predicate::Or(ps) => Predicate::Or(
                ps.iter().map(|p| p.try_map(&mut *f)).collect::<std::result::Result<_, _>>()?,
            ),
            Predicate::Not(p) => Predicate::Not(Box::new(p.try_map(&mut *f)?)),
            Predicate::Compare { operand, op, value } => Predicate::Compare {
                operand: f(operand)?,
                op: *op,
                value: value.clone(),
            },
            Predicate::Like { operand, pattern } => Predicate::Like {
                operand: f(operand)?,
                pattern: pattern.clone(),
            },
            Predicate::IsNull(operand) => Predicate::IsNull(f(operand)?),
        })
    }

    /// Évalue le prédicat ; `values` donne toutes les valeurs d'un opérande.
    ///
    /// Sémantique « au moins une » : sur une propriété multivaluée, la
    /// comparaison est vraie si une des valeurs la satisfait.
    pub fn evaluate_with(&self, values: &mut impl FnMut(&A) -> Result<Vec<Value>>) -> Result<bool> {
        match self {
            Predicate::Include => Ok(true),
            Predicate::Exclude => Ok(false),
            Predicate::And(ps) => {
                for p in ps {
                    if !p.evaluate_with(&mut *values)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(ps) => {
                for p in ps {
                    if p.evaluate_with(&mut *values)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(p) => Ok(!p.evaluate_with(&mut *values)?),
            Predicate::Compare { operand, op, value } => {
                Ok(values(operand)?.iter().any(|v| compare_values(v, *op, value)))
            }
            Predicate::Like { operand, pattern } => {
                let re = cached_like_regex(pattern)?;
                Ok(values(operand)?
                    .iter()
                    .any(|v| !v.is_null() && re.is_match(&v.as_text())))
            }
            Predicate::IsNull(operand) => Ok(values(operand)?.iter().all(|v| v.is_null())),
        }
    }
}

impl<A: fmt::Display> fmt::Display for Predicate<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |ps: &[Predicate<A>], sep: &str| {
            ps.iter().map(|p| format!("({})", p)).collect::<Vec<_>>().join(sep)
        };
        match self {
            Predicate::Include => write!(f, "INCLUDE"),
            Predicate::Exclude => write!(f, "EXCLUDE"),
            Predicate::And(ps) => write!(f, "{}", join(ps, " AND ")),
            Predicate::Or(ps) => write!(f, "{}", join(ps, " OR ")),
            Predicate::Not(p) => write!(f, "NOT ({})", p),
            Predicate::Compare { operand, op, value } => write!(f, "{} {} {}", operand, op, value),
            Predicate::Like { operand, pattern } => write!(f, "{} LIKE '{}'", operand, pattern),
            Predicate::IsNull(operand) => write!(f, "{} IS NULL", operand),
        }
    }
}

/// Évaluateur d'expressions et de filtres sur une ligne source.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expr: &Expression, row: &Row) -> Result<Value>;

    fn matches(&self, filter: &SourceFilter, row: &Row) -> Result<bool> {
        filter.evaluate_with(&mut |expr| Ok(vec![self.evaluate(expr, row)?]))
    }
}

/// Évaluateur par défaut : colonnes, littéraux, concaténation et quelques
/// fonctions de chaîne.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvaluator;

impl ExpressionEvaluator for DefaultEvaluator {
    fn evaluate(&self, expr: &Expression, row: &Row) -> Result<Value> {
        match expr {
            Expression::Column(name) => row.get(name).cloned().ok_or_else(|| {
                MappingError::evaluation(format!("colonne '{}' absente de la ligne", name))
            }),
            Expression::Literal(v) => Ok(v.clone()),
            Expression::Concat(parts) => self.concat(parts, row),
            Expression::Function { name, args } => match name.as_str() {
                "strConcat" => self.concat(args, row),
                "strToUpperCase" | "strToLowerCase" | "strTrim" => {
                    let [arg] = args.as_slice() else {
                        return Err(MappingError::evaluation(format!(
                            "{} attend 1 argument, reçu {}", name, args.len()
                        )));
                    };
                    let v = self.evaluate(arg, row)?;
                    if v.is_null() {
                        return Ok(Value::Null);
                    }
                    let text = v.as_text();
                    Ok(Value::String(match name.as_str() {
                        "strToUpperCase" => text.to_uppercase(),
                        "strToLowerCase" => text.to_lowercase(),
                        _ => text.trim().to_string(),
                    }))
                }
                other => Err(MappingError::evaluation(format!("fonction inconnue '{}'", other))),
            },
        }
    }
}

impl DefaultEvaluator {
    fn concat(&self, parts: &[Expression], row: &Row) -> Result<Value> {
        let mut out = String::new();
        for p in parts {
            let v = self.evaluate(p, row)?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            out.push_str(&v.as_text());
        }
        Ok(Value::String(out))
    }
}
