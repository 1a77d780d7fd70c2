use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::domain::{CaseId, Cohort, PatientId};
use crate::error::HarvestError;

/// External collaborator that resolves a cohort query. The core never speaks
/// SQL; whatever store backs this trait hands back the finished shape.
pub trait CohortSource {
    fn cohort_for_query(&self, query: &str) -> Result<Cohort, HarvestError>;
}

/// Builds the input cohort from a query (via the collaborator) or from a
/// cohort file. Supplying neither is a fatal precondition.
pub fn build_cohort(
    source: Option<&dyn CohortSource>,
    query: Option<&str>,
    cohort_file: Option<&Path>,
) -> Result<Cohort, HarvestError> {
    if let (Some(source), Some(query)) = (source, query) {
        return source.cohort_for_query(query);
    }
    if let Some(path) = cohort_file {
        return load_cohort_file(path);
    }
    Err(HarvestError::InvalidCohortSpec)
}

/// Loads a cohort file: a JSON object mapping case id to one submitter id or
/// a list of them, or a tab-separated table with `case_id` and
/// `case_submitter_id` columns (rows for the same case are grouped).
pub fn load_cohort_file(path: &Path) -> Result<Cohort, HarvestError> {
    let content =
        fs::read_to_string(path).map_err(|_| HarvestError::CohortRead(path.to_path_buf()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        parse_json_cohort(&content)
    } else {
        parse_tsv_cohort(&content)
    }
}

fn parse_json_cohort(content: &str) -> Result<Cohort, HarvestError> {
    let value: Value =
        serde_json::from_str(content).map_err(|err| HarvestError::CohortParse(err.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(HarvestError::CohortParse(
            "expected a JSON object mapping case ids to submitter ids".to_string(),
        ));
    };

    let mut cohort = Cohort::new();
    for (case, submitters) in object {
        let case: CaseId = case.parse()?;
        let submitters = match submitters {
            Value::String(single) => vec![single.parse::<PatientId>()?],
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .ok_or_else(|| {
                            HarvestError::CohortParse(format!(
                                "case {case}: submitter ids must be strings"
                            ))
                        })
                        .and_then(|text| text.parse::<PatientId>())
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => {
                return Err(HarvestError::CohortParse(format!(
                    "case {case}: expected a submitter id or a list of them"
                )));
            }
        };
        if submitters.is_empty() {
            return Err(HarvestError::CohortParse(format!(
                "case {case}: no submitter ids"
            )));
        }
        cohort.insert(case, submitters);
    }
    Ok(cohort)
}

fn parse_tsv_cohort(content: &str) -> Result<Cohort, HarvestError> {
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| HarvestError::CohortParse("empty cohort file".to_string()))?;
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();

    let case_column = columns
        .iter()
        .position(|name| *name == "case_id" || *name == "cases_case_id")
        .ok_or_else(|| HarvestError::CohortParse("missing case_id column".to_string()))?;
    let submitter_column = columns
        .iter()
        .position(|name| *name == "case_submitter_id" || *name == "cases_submitter_id")
        .ok_or_else(|| HarvestError::CohortParse("missing case_submitter_id column".to_string()))?;

    let mut pairs: Vec<(CaseId, Vec<PatientId>)> = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let (Some(case), Some(submitter)) =
            (fields.get(case_column), fields.get(submitter_column))
        else {
            return Err(HarvestError::CohortParse(format!("short row: {line}")));
        };
        let case: CaseId = case.parse()?;
        let submitter: PatientId = submitter.parse()?;
        match pairs.iter_mut().find(|(existing, _)| *existing == case) {
            Some((_, submitters)) => {
                if !submitters.contains(&submitter) {
                    submitters.push(submitter);
                }
            }
            None => pairs.push((case, vec![submitter])),
        }
    }

    let mut cohort = Cohort::new();
    for (case, submitters) in pairs {
        cohort.insert(case, submitters);
    }
    Ok(cohort)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn neither_query_nor_file_is_fatal() {
        let err = build_cohort(None, None, None).unwrap_err();
        assert_matches!(err, HarvestError::InvalidCohortSpec);
    }

    #[test]
    fn json_cohort_accepts_single_and_list_submitters() {
        let cohort =
            parse_json_cohort(r#"{"case-1": "TCGA-01", "case-2": ["TCGA-02", "TCGA-03"]}"#)
                .unwrap();
        assert_eq!(cohort.len(), 2);
        let submitters: Vec<_> = cohort
            .iter()
            .flat_map(|(_, submitters)| submitters.iter().map(|s| s.as_str().to_string()))
            .collect();
        assert!(submitters.contains(&"TCGA-01".to_string()));
        assert!(submitters.contains(&"TCGA-03".to_string()));
    }

    #[test]
    fn tsv_cohort_groups_rows_by_case() {
        let cohort = parse_tsv_cohort(
            "cases_case_id\tcases_submitter_id\ncase-1\tTCGA-01\ncase-1\tTCGA-01b\ncase-2\tTCGA-02\n",
        )
        .unwrap();
        assert_eq!(cohort.len(), 2);
        let first = cohort.iter().next().unwrap();
        assert_eq!(first.0.as_str(), "case-1");
        assert_eq!(first.1.len(), 2);
    }

    #[test]
    fn tsv_without_expected_columns_fails() {
        let err = parse_tsv_cohort("id\tname\nx\ty\n").unwrap_err();
        assert_matches!(err, HarvestError::CohortParse(_));
    }
}
