//! Filter vocabulary shared by the Assembler (year range / basis-of-record)
//! and the Search Backend Adapter (arbitrary occurrence-search
//! predicates).
//!
//! The validated, depth-bounded rule tree (combinator, nested groups, a
//! closed set of fields, a closed set of operators, depth/rule/list-size
//! caps) renders to a JSON query body for the Search Backend Adapter's
//! geogrid aggregation request rather than a SQL `WHERE` clause, since
//! this system's ad-hoc path has no SQL store to build clauses against.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ValidationError;

const MAX_FILTER_DEPTH: usize = 5;
const MAX_FILTER_RULES: usize = 100;
const MAX_LIST_VALUES: usize = 50;

/// Inclusive year range parsed from the `year` query parameter:
/// `YYYY`, `YYYY,YYYY`, `,YYYY` (open start) or `YYYY,` (open end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl YearRange {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ValidationError::new("year parameter must not be empty"));
        }

        let parse_bound = |s: &str| -> Result<Option<i64>, ValidationError> {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<i64>()
                    .map(Some)
                    .map_err(|_| ValidationError::new(format!("invalid year value '{s}'")))
            }
        };

        if let Some((lo, hi)) = raw.split_once(',') {
            let min = parse_bound(lo.trim())?;
            let max = parse_bound(hi.trim())?;
            if min.is_none() && max.is_none() {
                return Err(ValidationError::new("year range has no bounds"));
            }
            Ok(Self { min, max })
        } else {
            let year = parse_bound(raw)?;
            Ok(Self {
                min: year,
                max: year,
            })
        }
    }

    pub fn contains(&self, year: i64) -> bool {
        self.min.is_none_or(|min| year >= min) && self.max.is_none_or(|max| year <= max)
    }
}

/// Year-range and basis-of-record filtering applied by the Assembler
/// while projecting each stored feature's attribute map.
#[derive(Debug, Clone, Default)]
pub struct OccurrenceFilters {
    pub years: Option<YearRange>,
    pub basis_of_record: HashSet<String>,
    pub verbose: bool,
}

impl OccurrenceFilters {
    pub fn year_passes(&self, year: i64) -> bool {
        self.years.is_none_or(|range| range.contains(year))
    }

    pub fn basis_of_record_passes(&self, code: &str) -> bool {
        self.basis_of_record.is_empty() || self.basis_of_record.contains(code)
    }
}

/// The closed set of occurrence-search predicate fields this service
/// recognises on the ad-hoc path. Closed (rather than a free-form string)
/// so malformed or injected field names fail validation rather than being
/// forwarded to the search backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterField {
    TaxonKey,
    HigherTaxonKey,
    DatasetKey,
    Country,
    BasisOfRecord,
    InstitutionCode,
    RecordedBy,
    CoordinatesPresent,
    Year,
}

impl FilterField {
    pub const fn as_query_field(&self) -> &'static str {
        match self {
            Self::TaxonKey => "taxonKey",
            Self::HigherTaxonKey => "higherTaxonKey",
            Self::DatasetKey => "datasetKey",
            Self::Country => "country",
            Self::BasisOfRecord => "basisOfRecord",
            Self::InstitutionCode => "institutionCode",
            Self::RecordedBy => "recordedBy",
            Self::CoordinatesPresent => "hasCoordinate",
            Self::Year => "year",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gte,
    Lte,
    In,
    NotIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: FilterField,
    pub operator: Operator,
    pub value: FilterValue,
}

impl Condition {
    fn validate(&self) -> Result<(), ValidationError> {
        match &self.value {
            FilterValue::List(values) if values.len() > MAX_LIST_VALUES => Err(
                ValidationError::new(format!("lists are limited to {MAX_LIST_VALUES} values")),
            ),
            _ => Ok(()),
        }
    }

    fn to_query(&self) -> Value {
        let field = self.field.as_query_field();
        match self.operator {
            Operator::Eq => json!({"term": {field: self.value}}),
            Operator::Neq => json!({"bool": {"must_not": [{"term": {field: self.value}}]}}),
            Operator::Gte => json!({"range": {field: {"gte": self.value}}}),
            Operator::Lte => json!({"range": {field: {"lte": self.value}}}),
            Operator::In => json!({"terms": {field: self.value}}),
            Operator::NotIn => {
                json!({"bool": {"must_not": [{"terms": {field: self.value}}]}})
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rule {
    Condition(Condition),
    Group(FilterGroup),
}

impl Rule {
    fn to_query(&self) -> Value {
        match self {
            Self::Condition(c) => c.to_query(),
            Self::Group(g) => g.to_query(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterGroup {
    pub combinator: Combinator,
    pub rules: Vec<Rule>,
}

impl FilterGroup {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut rule_count = 0usize;
        validate_group(self, 1, &mut rule_count)
    }

    /// Render as a search-backend bool query fragment.
    pub fn to_query(&self) -> Value {
        let clauses: Vec<Value> = self.rules.iter().map(Rule::to_query).collect();
        let key = match self.combinator {
            Combinator::And => "must",
            Combinator::Or => "should",
        };
        json!({"bool": {key: clauses}})
    }
}

fn validate_group(
    group: &FilterGroup,
    depth: usize,
    rule_count: &mut usize,
) -> Result<(), ValidationError> {
    if depth > MAX_FILTER_DEPTH {
        return Err(ValidationError::new(format!(
            "filters exceed maximum depth of {MAX_FILTER_DEPTH}"
        )));
    }

    for rule in &group.rules {
        match rule {
            Rule::Condition(condition) => {
                *rule_count += 1;
                if *rule_count > MAX_FILTER_RULES {
                    return Err(ValidationError::new(format!(
                        "filters exceed maximum of {MAX_FILTER_RULES} conditions"
                    )));
                }
                condition.validate()?;
            }
            Rule::Group(child) => validate_group(child, depth + 1, rule_count)?,
        }
    }

    Ok(())
}

impl TryFrom<&str> for FilterGroup {
    type Error = ValidationError;

    fn try_from(filter_json: &str) -> Result<Self, Self::Error> {
        let filter: FilterGroup = serde_json::from_str(filter_json)
            .map_err(|e| ValidationError::new(format!("invalid filter JSON: {e}")))?;
        filter.validate()?;
        Ok(filter)
    }
}
