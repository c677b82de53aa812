// =============================================================================
// BACKEND MEMORY — Source tabulaire en mémoire
// =============================================================================
//
// Implémentation de référence des collaborateurs du moteur :
//   MemoryCatalog  → SourceFactory (bases → tables), garde des compteurs
//   MemorySource   → TabularSource d'une base (filtre + tri en mémoire)
//   MemoryCursor   → Cursor sur une copie filtrée/triée des lignes
//
// Un descripteur `memory` désigne une BASE via le paramètre `database` ;
// la table lue est le `source_type` de la requête. Plusieurs mappings
// d'une même base partagent donc une seule source.
//
// Les tables peuvent être écrites au format « properties » :
//
//   _=ID:String,NAME:String,AGE:Integer
//   gu.1=gu.1|Yaugher|40
//   gu.2=gu.2||12
//
// La clé avant `=` devient la colonne FID ; une cellule vide vaut Null.
//
// Pour les tests, une table peut refuser l'ouverture ou casser en cours de
// lecture, et le catalogue compte sources créées / libérées et curseurs
// encore ouverts.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use tracing::trace;
use crate::core::expression::{DefaultEvaluator, ExpressionEvaluator};
use crate::core::source::{Cursor, Row, SourceDescriptor, SourceFactory, SourceQuery, TabularSource};
use crate::core::typeside::Value;
use crate::error::{MappingError, Result};

/// Type de descripteur reconnu par le catalogue
pub const MEMORY_KIND: &str = "memory";

/// Une table : colonnes + lignes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    fail_on_open: bool,
    fail_after_rows: Option<usize>,
}

impl MemoryTable {
    pub fn new(columns: &[&str]) -> Self {
        MemoryTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..MemoryTable::default()
        }
    }

    /// Ajoute une ligne ; le nombre de valeurs doit égaler le nombre de colonnes.
    pub fn push_row(&mut self, values: Vec<Value>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(MappingError::configuration(format!(
                "ligne de {} valeurs pour {} colonnes",
                values.len(),
                self.columns.len()
            )));
        }
        self.rows.push(values);
        Ok(())
    }

    /// Lit une table au format properties (voir l'en-tête du module).
    pub fn from_properties(text: &str) -> Result<Self> {
        let mut lines = text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        let header = lines.next()
            .and_then(|l| l.strip_prefix("_="))
            .ok_or_else(|| MappingError::configuration("en-tête '_=' manquant"))?;

        let mut columns = vec!["FID".to_string()];
        let mut types = Vec::new();
        for decl in header.split(',') {
            let (name, ty) = decl.split_once(':').unwrap_or((decl, "String"));
            columns.push(name.trim().to_string());
            types.push(ty.trim().to_string());
        }

        let mut table = MemoryTable {
            columns,
            ..MemoryTable::default()
        };
        for line in lines {
            let (fid, rest) = line.split_once('=').ok_or_else(|| {
                MappingError::configuration(format!("ligne sans identifiant : '{}'", line))
            })?;
            let cells: Vec<&str> = rest.split('|').collect();
            if cells.len() != types.len() {
                return Err(MappingError::configuration(format!(
                    "'{}' : {} cellules pour {} colonnes", fid, cells.len(), types.len()
                )));
            }
            let mut values = vec![Value::from(fid.trim())];
            for (cell, ty) in cells.iter().zip(&types) {
                values.push(parse_cell(cell, ty)?);
            }
            table.rows.push(values);
        }
        Ok(table)
    }

    /// L'ouverture d'un curseur sur cette table échouera
    pub fn failing_on_open(mut self) -> Self {
        self.fail_on_open = true;
        self
    }

    /// Le curseur échouera après avoir livré `n` lignes
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after_rows = Some(n);
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn row(&self, values: &[Value]) -> Row {
        Row::new(self.columns.iter().cloned().zip(values.iter().cloned()).collect())
    }
}

fn parse_cell(cell: &str, ty: &str) -> Result<Value> {
    if cell.is_empty() {
        return Ok(Value::Null);
    }
    let bad = |e: &dyn std::fmt::Display| {
        MappingError::configuration(format!("cellule '{}' illisible en {} : {}", cell, ty, e))
    };
    match ty.to_ascii_lowercase().as_str() {
        "integer" | "int" | "long" => cell.trim().parse::<i64>().map(Value::Integer).map_err(|e| bad(&e)),
        "double" | "float" => cell.trim().parse::<f64>().map(Value::Float).map_err(|e| bad(&e)),
        "boolean" => cell.trim().parse::<bool>().map(Value::Boolean).map_err(|e| bad(&e)),
        _ => Ok(Value::String(cell.to_string())),
    }
}

// ─── Catalogue ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct CatalogState {
    databases: RwLock<HashMap<String, HashMap<String, Arc<MemoryTable>>>>,
    sources_created: AtomicUsize,
    sources_disposed: AtomicUsize,
    cursors_opened: AtomicUsize,
    open_cursors: AtomicUsize,
    opened_by_table: Mutex<HashMap<String, usize>>,
}

/// Ensemble de bases en mémoire ; fabrique de sources.
#[derive(Default)]
pub struct MemoryCatalog {
    state: Arc<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        MemoryCatalog::default()
    }

    /// Ajoute (ou remplace) une table ; visible aussi des sources déjà créées.
    pub fn add_table(&self, database: &str, table: &str, content: MemoryTable) {
        self.state.databases.write()
            .entry(database.to_string())
            .or_default()
            .insert(table.to_string(), Arc::new(content));
    }

    pub fn sources_created(&self) -> usize {
        self.state.sources_created.load(Ordering::SeqCst)
    }

    pub fn sources_disposed(&self) -> usize {
        self.state.sources_disposed.load(Ordering::SeqCst)
    }

    /// Nombre total de curseurs ouverts depuis la création du catalogue
    pub fn cursors_opened(&self) -> usize {
        self.state.cursors_opened.load(Ordering::SeqCst)
    }

    /// Curseurs ouverts sur une table donnée, toutes bases confondues
    pub fn cursors_opened_on(&self, table: &str) -> usize {
        self.state.opened_by_table.lock().get(table).copied().unwrap_or(0)
    }

    /// Curseurs ouverts et pas encore fermés
    pub fn open_cursors(&self) -> usize {
        self.state.open_cursors.load(Ordering::SeqCst)
    }
}

impl SourceFactory for MemoryCatalog {
    fn create(&self, descriptor: &SourceDescriptor) -> Result<Arc<dyn TabularSource>> {
        if !descriptor.kind.trim().eq_ignore_ascii_case(MEMORY_KIND) {
            return Err(MappingError::source_unavailable(format!(
                "type de source '{}' inconnu du catalogue mémoire", descriptor.kind
            )));
        }
        let database = descriptor.params.iter()
            .find(|(k, _)| k.trim() == "database")
            .map(|(_, v)| v.trim().to_string())
            .ok_or_else(|| MappingError::configuration("paramètre 'database' manquant"))?;
        if !self.state.databases.read().contains_key(&database) {
            return Err(MappingError::source_unavailable(format!("base '{}' introuvable", database)));
        }
        self.state.sources_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySource {
            name: format!("memory:{}", database),
            database,
            state: Arc::clone(&self.state),
            disposed: AtomicBool::new(false),
        }))
    }
}

// ─── Source ──────────────────────────────────────────────────────────────────

/// Une base du catalogue vue comme source tabulaire.
pub struct MemorySource {
    name: String,
    database: String,
    state: Arc<CatalogState>,
    disposed: AtomicBool,
}

impl TabularSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, query: &SourceQuery) -> Result<Box<dyn Cursor>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MappingError::source_unavailable(format!("source '{}' déjà libérée", self.name)));
        }
        let table = self.state.databases.read()
            .get(&self.database)
            .and_then(|tables| tables.get(&query.source_type))
            .cloned()
            .ok_or_else(|| MappingError::source_unavailable(format!(
                "table '{}' absente de '{}'", query.source_type, self.database
            )))?;
        if table.fail_on_open {
            return Err(MappingError::source_unavailable(format!(
                "ouverture de '{}' refusée", query.source_type
            )));
        }

        let evaluator = DefaultEvaluator;
        let mut selected = Vec::new();
        for values in &table.rows {
            let row = table.row(values);
            let keep = match &query.filter {
                Some(filter) => evaluator.matches(filter, &row)?,
                None => true,
            };
            if keep {
                let keys = query.sort_by.iter()
                    .map(|e| evaluator.evaluate(e, &row))
                    .collect::<Result<Vec<Value>>>()?;
                selected.push((keys, row));
            }
        }
        // tri stable : l'ordre d'insertion départage les clés égales
        selected.sort_by(|(a, _), (b, _)| {
            a.iter().zip(b).map(|(x, y)| x.total_cmp(y))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        trace!(source = %self.name, table = %query.source_type, rows = selected.len(), "curseur mémoire ouvert");
        self.state.cursors_opened.fetch_add(1, Ordering::SeqCst);
        self.state.open_cursors.fetch_add(1, Ordering::SeqCst);
        *self.state.opened_by_table.lock().entry(query.source_type.clone()).or_default() += 1;
        Ok(Box::new(MemoryCursor {
            rows: selected.into_iter().map(|(_, r)| r).collect::<Vec<_>>().into_iter(),
            delivered: 0,
            fail_after_rows: table.fail_after_rows,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.state.sources_disposed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ─── Curseur ─────────────────────────────────────────────────────────────────

pub struct MemoryCursor {
    rows: std::vec::IntoIter<Row>,
    delivered: usize,
    fail_after_rows: Option<usize>,
    state: Arc<CatalogState>,
    closed: bool,
}

impl Cursor for MemoryCursor {
    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(MappingError::illegal_state("lecture sur un curseur fermé"));
        }
        if self.fail_after_rows == Some(self.delivered) {
            return Err(MappingError::source_unavailable(format!(
                "lecture interrompue après {} lignes", self.delivered
            )));
        }
        let row = self.rows.next();
        if row.is_some() {
            self.delivered += 1;
        }
        Ok(row)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.close();
    }
}
