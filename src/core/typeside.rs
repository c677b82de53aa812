// =============================================================================
// TYPESIDE — Les valeurs primitives qui circulent dans le moteur
// =============================================================================
//
// Chaque cellule d'une ligne source, chaque valeur simple d'une propriété
// matérialisée et chaque identité de feature est une `Value`.
//
// ORDRE TOTAL :
//   Le regroupement par identité exige que la source livre les lignes triées.
//   Il faut donc un ordre total sur les valeurs, y compris entre types :
//     Null < nombres (Int et Float comparés numériquement) < Bool < String
//
// =============================================================================

use std::cmp::Ordering;
use std::fmt;
use serde::{Deserialize, Serialize};

/// Une valeur concrète.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(std::string::String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Null,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Null => write!(f, "NULL"),
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Rendu textuel brut (sans guillemets). Null → chaîne vide.
    ///
    /// Sert pour les identifiants de features et les gabarits de référence.
    pub fn as_text(&self) -> std::string::String {
        match self {
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(fl) => fl.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Null => std::string::String::new(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Float(_) => 1,
            Value::Boolean(_) => 2,
            Value::String(_) => 3,
        }
    }

    /// Ordre total entre valeurs, utilisé pour trier par identité.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Deux valeurs désignent-elles la même identité ?
    pub fn same_identity(&self, other: &Value) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<std::string::String> for Value {
    fn from(s: std::string::String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
