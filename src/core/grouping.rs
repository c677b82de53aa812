// =============================================================================
// GROUPING — Regroupement des lignes par identité
// =============================================================================
//
// Une feature logique peut s'étaler sur plusieurs lignes consécutives
// (données dénormalisées) :
//
//   ID        NAME
//   gu.25678  Yaugher Volcanic Group 1   ┐
//   gu.25678  Yaugher Volcanic Group 2   ├─ un seul groupe
//   gu.25678  -Py                        ┘
//   gu.25682  New Automan Sandstone      ── un autre groupe
//
// Le curseur est ouvert trié par l'expression d'identité. On lit avec UNE
// ligne d'avance : la première ligne d'identité différente est mise de côté
// et ouvre le groupe suivant.
//
// Si la source rend des identités hors d'ordre, on ne fusionne pas : un
// nouveau groupe commence et un avertissement est tracé.
//
// =============================================================================

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{trace, warn};
use super::expression::{Expression, ExpressionEvaluator};
use super::source::{Cursor, Row};
use super::typeside::Value;
use crate::error::{MappingError, Result};

/// Lignes consécutives de même identité (jamais vide).
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityGroup {
    pub identity: Value,
    pub rows: Vec<Row>,
}

impl IdentityGroup {
    /// Identifiant textuel de la feature produite
    pub fn feature_id(&self) -> String {
        self.identity.as_text()
    }
}

/// Découpe un curseur trié en groupes d'identité.
pub struct IdentityGrouper {
    cursor: Option<Box<dyn Cursor>>,
    identity: Expression,
    evaluator: Arc<dyn ExpressionEvaluator>,
    lookahead: Option<(Value, Row)>,
    last_identity: Option<Value>,
    warn_unordered: bool,
}

impl IdentityGrouper {
    pub fn new(cursor: Box<dyn Cursor>, identity: Expression, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        IdentityGrouper {
            cursor: Some(cursor),
            identity,
            evaluator,
            lookahead: None,
            last_identity: None,
            warn_unordered: true,
        }
    }

    pub fn warn_on_unordered(mut self, enabled: bool) -> Self {
        self.warn_unordered = enabled;
        self
    }

    /// Groupe suivant, ou None quand la source est épuisée.
    pub fn next_group(&mut self) -> Result<Option<IdentityGroup>> {
        let (identity, first) = match self.lookahead.take() {
            Some(pending) => pending,
            None => match self.read()? {
                Some(pending) => pending,
                None => return Ok(None),
            },
        };

        if let Some(last) = &self.last_identity {
            if self.warn_unordered && identity.total_cmp(last) == Ordering::Less {
                warn!(previous = %last, current = %identity, "identités non triées : nouveau groupe");
            }
        }

        let mut rows = vec![first];
        while let Some((next_identity, row)) = self.read()? {
            if next_identity.same_identity(&identity) {
                rows.push(row);
            } else {
                self.lookahead = Some((next_identity, row));
                break;
            }
        }

        trace!(identity = %identity, rows = rows.len(), "groupe d'identité");
        self.last_identity = Some(identity.clone());
        Ok(Some(IdentityGroup { identity, rows }))
    }

    /// Ferme le curseur sous-jacent ; idempotent.
    pub fn close(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
        self.lookahead = None;
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.is_none()
    }

    fn read(&mut self) -> Result<Option<(Value, Row)>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let Some(row) = cursor.next_row()? else {
            return Ok(None);
        };
        let identity = self.evaluator.evaluate(&self.identity, &row)?;
        if identity.is_null() {
            return Err(MappingError::evaluation(format!(
                "identité nulle ({}) sur la ligne {:?}", self.identity, row
            )));
        }
        Ok(Some((identity, row)))
    }
}

impl Drop for IdentityGrouper {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use proptest::prelude::*;
    use crate::core::expression::DefaultEvaluator;

    struct VecCursor {
        rows: std::vec::IntoIter<Row>,
        closes: Arc<AtomicUsize>,
    }

    impl Cursor for VecCursor {
        fn next_row(&mut self) -> Result<Option<Row>> {
            Ok(self.rows.next())
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn grouper(ids: &[Option<i64>]) -> (IdentityGrouper, Arc<AtomicUsize>) {
        let rows: Vec<Row> = ids.iter().enumerate()
            .map(|(n, id)| Row::new(vec![
                ("ID", id.map(Value::Integer).unwrap_or(Value::Null)),
                ("N", Value::Integer(n as i64)),
            ]))
            .collect();
        let closes = Arc::new(AtomicUsize::new(0));
        let cursor = VecCursor { rows: rows.into_iter(), closes: Arc::clone(&closes) };
        let g = IdentityGrouper::new(Box::new(cursor), Expression::column("ID"), Arc::new(DefaultEvaluator));
        (g, closes)
    }

    fn sizes(g: &mut IdentityGrouper) -> Vec<(Value, usize)> {
        let mut out = Vec::new();
        while let Some(group) = g.next_group().unwrap() {
            out.push((group.identity, group.rows.len()));
        }
        out
    }

    #[test]
    fn test_groups_consecutive_rows() {
        let (mut g, _) = grouper(&[Some(1), Some(1), Some(1), Some(2), Some(3), Some(3)]);
        assert_eq!(sizes(&mut g), vec![
            (Value::Integer(1), 3),
            (Value::Integer(2), 1),
            (Value::Integer(3), 2),
        ]);
        // épuisé : reste épuisé
        assert!(g.next_group().unwrap().is_none());
    }

    #[test]
    fn test_rows_keep_source_order() {
        let (mut g, _) = grouper(&[Some(7), Some(7)]);
        let group = g.next_group().unwrap().unwrap();
        let order: Vec<Option<&Value>> = group.rows.iter().map(|r| r.get("N")).collect();
        assert_eq!(order, vec![Some(&Value::Integer(0)), Some(&Value::Integer(1))]);
        assert_eq!(group.feature_id(), "7");
    }

    #[test]
    fn test_unordered_identities_open_new_group() {
        let (mut g, _) = grouper(&[Some(1), Some(2), Some(1)]);
        assert_eq!(sizes(&mut g).len(), 3);
    }

    #[test]
    fn test_empty_source() {
        let (mut g, _) = grouper(&[]);
        assert!(g.next_group().unwrap().is_none());
    }

    #[test]
    fn test_null_identity_is_an_error() {
        let (mut g, _) = grouper(&[Some(1), None]);
        let err = g.next_group().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Evaluation);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut g, closes) = grouper(&[Some(1)]);
        g.close();
        g.close();
        drop(g);
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_groups_partition_sorted_rows(mut ids in proptest::collection::vec(0i64..6, 0..40)) {
            ids.sort();
            let input: Vec<Option<i64>> = ids.iter().copied().map(Some).collect();
            let (mut g, _) = grouper(&input);
            let groups = sizes(&mut g);

            let mut distinct = ids.clone();
            distinct.dedup();
            prop_assert_eq!(groups.len(), distinct.len());
            prop_assert_eq!(groups.iter().map(|(_, n)| n).sum::<usize>(), ids.len());
            for ((identity, n), id) in groups.iter().zip(&distinct) {
                prop_assert_eq!(identity, &Value::Integer(*id));
                prop_assert_eq!(*n, ids.iter().filter(|x| *x == id).count());
            }
        }
    }
}
