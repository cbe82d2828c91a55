//! History filter engine.
//!
//! Search criteria become a list of typed [`Predicate`]s joined with `AND`.
//! Each predicate contributes a fixed SQL fragment with a `?` placeholder and a
//! separately bound value, so no user supplied text ever reaches the SQL string.
//! The owner predicate is installed by [`HistoryFilter::for_owner`] and cannot
//! be removed.

use rusqlite::ToSql;
use serde::Serialize;

use super::{parse_column, AccountId, HistoryId, Store, StoreError};
use crate::labels::{Label, ModelVariant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate {
    Owner(AccountId),
    Model(ModelVariant),
    Label(Label),
    /// Lower bound on `highest_prob`, as a fraction in `[0, 1]`.
    MinProbability(f64),
}

impl Predicate {
    fn clause(&self) -> &'static str {
        match self {
            Predicate::Owner(_) => "account_id = ?",
            Predicate::Model(_) => "model = ?",
            Predicate::Label(_) => "pred = ?",
            Predicate::MinProbability(_) => "highest_prob >= ?",
        }
    }

    fn value(&self) -> Box<dyn ToSql> {
        match *self {
            Predicate::Owner(id) => Box::new(id),
            Predicate::Model(model) => Box::new(model.tag()),
            Predicate::Label(label) => Box::new(label.to_string()),
            Predicate::MinProbability(fraction) => Box::new(fraction),
        }
    }
}

/// User facing search criteria. `None` stands for the "Any" choice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    pub model: Option<ModelVariant>,
    pub label: Option<Label>,
    /// Percentage in `[0, 100]`; zero means no constraint.
    pub min_probability: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryFilter {
    predicates: Vec<Predicate>,
}

impl HistoryFilter {
    pub fn for_owner(owner_id: AccountId) -> Self {
        Self {
            predicates: vec![Predicate::Owner(owner_id)],
        }
    }

    /// Predicates follow the form order: owner, model, label, then the
    /// minimum probability.
    pub fn from_criteria(owner_id: AccountId, criteria: &SearchCriteria) -> Self {
        let mut filter = Self::for_owner(owner_id);
        if let Some(model) = criteria.model {
            filter = filter.model(model);
        }
        if let Some(label) = criteria.label {
            filter = filter.label(label);
        }
        filter.min_probability(criteria.min_probability)
    }

    pub fn model(mut self, model: ModelVariant) -> Self {
        self.predicates.push(Predicate::Model(model));
        self
    }

    pub fn label(mut self, label: Label) -> Self {
        self.predicates.push(Predicate::Label(label));
        self
    }

    /// `percent` of zero (or below) adds nothing, so "at least 0%" and "no
    /// filter" are the same query.
    pub fn min_probability(mut self, percent: f64) -> Self {
        if percent > 0.0 {
            let fraction = percent / 100.0;
            self.predicates.push(Predicate::MinProbability(fraction));
        }
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn compile(&self) -> CompiledQuery {
        let conditions: Vec<&str> = self.predicates.iter().map(Predicate::clause).collect();
        let sql = format!(
            "SELECT id, highest_prob, pred, model FROM history_record WHERE {} ORDER BY id",
            conditions.join(" AND ")
        );
        let params = self.predicates.iter().map(Predicate::value).collect();
        CompiledQuery { sql, params }
    }
}

pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Box<dyn ToSql>>,
}

/// One row of a history search, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Where the record's image can be fetched. Derived from the record id,
    /// so concurrent searches never share an artifact.
    pub artifact: String,
    pub model: ModelVariant,
    pub label: Label,
    pub probability_percent: f64,
    pub record_id: HistoryId,
}

pub fn artifact_reference(id: HistoryId) -> String {
    format!("/history/{}/image", id)
}

impl Store {
    pub fn search_history(&self, filter: &HistoryFilter) -> Result<Vec<SearchResult>, StoreError> {
        let query = filter.compile();
        let mut stmt = self.conn.prepare(&query.sql)?;
        let params_refs: Vec<&dyn ToSql> = query.params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            let id: HistoryId = row.get(0)?;
            let highest_prob: f64 = row.get(1)?;
            Ok(SearchResult {
                artifact: artifact_reference(id),
                model: parse_column(row, 3)?,
                label: parse_column(row, 2)?,
                probability_percent: (highest_prob * 100.0 * 100.0).round() / 100.0,
                record_id: id,
            })
        })?;
        let results = rows.collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(count = results.len(), "History search complete");
        Ok(results)
    }
}
