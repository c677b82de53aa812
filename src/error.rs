// =============================================================================
// ERROR — Les erreurs du moteur de matérialisation
// =============================================================================
//
// Quatre familles d'erreurs, plus une pour les mauvais usages de l'itérateur :
//   Configuration     → mapping imbriqué manquant ou cyclique (au chargement)
//   SourceUnavailable → la source sous-jacente refuse d'ouvrir / de lire
//   Evaluation        → une expression échoue sur une ligne
//   PathResolution    → un chemin de propriété ne se résout pas (avant toute I/O)
//   IllegalState      → next() appelé hors de l'état READY
//
// Aucune erreur n'est rejouée : la politique de retry appartient à la source.
//
// =============================================================================

use std::fmt;
use thiserror::Error;

/// Catégorie d'erreur, utile pour les tests et les logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    SourceUnavailable,
    Evaluation,
    PathResolution,
    IllegalState,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::Evaluation => "evaluation",
            ErrorKind::PathResolution => "path_resolution",
            ErrorKind::IllegalState => "illegal_state",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Erreur du moteur.
#[derive(Debug, Error)]
pub enum MappingError {
    /// Référence imbriquée manquante ou cyclique, mapping mal formé.
    #[error("[configuration] {0}")]
    Configuration(String),

    /// La source sous-jacente a échoué à l'ouverture ou à la lecture.
    #[error("[source_unavailable] {message}")]
    SourceUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Une expression a échoué sur une ligne.
    #[error("[evaluation] {0}")]
    Evaluation(String),

    /// Un chemin de propriété ne se résout pas contre le graphe de mappings.
    #[error("[path_resolution] chemin '{path}' : {reason}")]
    PathResolution { path: String, reason: String },

    /// Opération invalide dans l'état courant de l'itérateur.
    #[error("[illegal_state] {0}")]
    IllegalState(String),
}

impl MappingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        MappingError::Configuration(message.into())
    }

    pub fn source_unavailable(message: impl Into<String>) -> Self {
        MappingError::SourceUnavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        MappingError::Evaluation(message.into())
    }

    pub fn path_resolution(path: impl Into<String>, reason: impl Into<String>) -> Self {
        MappingError::PathResolution {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        MappingError::IllegalState(message.into())
    }

    /// Attache une cause à une erreur de source.
    pub fn with_source(self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        match self {
            MappingError::SourceUnavailable { message, .. } => MappingError::SourceUnavailable {
                message,
                source: Some(Box::new(cause)),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MappingError::Configuration(_) => ErrorKind::Configuration,
            MappingError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            MappingError::Evaluation(_) => ErrorKind::Evaluation,
            MappingError::PathResolution { .. } => ErrorKind::PathResolution,
            MappingError::IllegalState(_) => ErrorKind::IllegalState,
        }
    }
}

impl From<serde_json::Error> for MappingError {
    fn from(err: serde_json::Error) -> Self {
        MappingError::configuration(format!("JSON invalide : {}", err))
    }
}

/// Alias de résultat du crate.
pub type Result<T> = std::result::Result<T, MappingError>;
