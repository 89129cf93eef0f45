//! Pipeline stages. Each reads the accumulated [`RunState`] and returns a
//! [`StatePatch`]; none mutates state directly.
//!
//! [`RunState`]: crate::state::RunState
//! [`StatePatch`]: crate::state::StatePatch

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use autoeval_types::{EvalCase, SuiteVersion};

use crate::cancel::CancelFlag;
use crate::config::Settings;
use crate::engine::Services;
use crate::retry::RetryPolicy;
use crate::store::RecordStore;
use crate::vector::VectorIndex;

pub mod author;
pub mod curriculum;
pub mod execute;
pub mod finalize;
pub mod init_run;
pub mod judge;
pub mod load_docs;

/// What every stage can reach besides the run state.
pub struct StageContext<'a> {
    pub services: &'a Services,
    pub cancel: &'a CancelFlag,
    pub retry: RetryPolicy,
}

impl<'a> StageContext<'a> {
    pub fn store(&self) -> &'a dyn RecordStore {
        self.services.store.as_ref()
    }

    pub fn vectors(&self) -> Option<&'a dyn VectorIndex> {
        self.services.vectors.as_deref()
    }

    pub fn settings(&self) -> &'a Settings {
        &self.services.settings
    }
}

// ---------------------------------------------------------------------------
// Eval-id normalisation
// ---------------------------------------------------------------------------

static EVAL_ID: OnceLock<Option<Regex>> = OnceLock::new();

fn is_well_formed(eval_id: &str) -> bool {
    EVAL_ID
        .get_or_init(|| Regex::new(r"^v\d+-case-\d{4}$").ok())
        .as_ref()
        .map_or(false, |re| re.is_match(eval_id))
}

/// Make sure every case carries a unique, well-formed id for `version`.
///
/// If any id is malformed, carries another version's prefix, or collides,
/// the whole suite is renumbered `v{n}-case-0001…` in order. Returns the
/// suite and whether it was renumbered.
pub fn normalize_eval_ids(version: SuiteVersion, mut cases: Vec<EvalCase>) -> (Vec<EvalCase>, bool) {
    let prefix = format!("{}-case-", version.as_str());
    let mut seen = HashSet::new();
    let valid = cases.iter().all(|case| {
        is_well_formed(&case.eval_id)
            && case.eval_id.starts_with(&prefix)
            && seen.insert(case.eval_id.clone())
    });
    if valid {
        return (cases, false);
    }
    for (i, case) in cases.iter_mut().enumerate() {
        case.eval_id = version.case_id(i);
    }
    (cases, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoeval_types::Difficulty;
    use std::collections::BTreeMap;

    fn case(id: &str) -> EvalCase {
        EvalCase {
            eval_id: id.into(),
            doc_id: "doc".into(),
            prompt_template: "p".into(),
            constraints: BTreeMap::new(),
            rubric_note: String::new(),
            difficulty_tag: Difficulty::Easy,
            category_tag: "c".into(),
        }
    }

    fn ids(cases: &[EvalCase]) -> Vec<&str> {
        cases.iter().map(|c| c.eval_id.as_str()).collect()
    }

    #[test]
    fn well_formed_ids_are_kept() {
        let (cases, renumbered) =
            normalize_eval_ids(SuiteVersion::V1, vec![case("v1-case-0007"), case("v1-case-0002")]);
        assert!(!renumbered);
        assert_eq!(ids(&cases), vec!["v1-case-0007", "v1-case-0002"]);
    }

    #[test]
    fn malformed_id_renumbers_suite() {
        let (cases, renumbered) =
            normalize_eval_ids(SuiteVersion::V1, vec![case("v1-case-0001"), case("case-2")]);
        assert!(renumbered);
        assert_eq!(ids(&cases), vec!["v1-case-0001", "v1-case-0002"]);
    }

    #[test]
    fn wrong_version_renumbers_suite() {
        let (cases, renumbered) =
            normalize_eval_ids(SuiteVersion::V2, vec![case("v1-case-0001"), case("v2-case-0002")]);
        assert!(renumbered);
        assert_eq!(ids(&cases), vec!["v2-case-0001", "v2-case-0002"]);
    }

    #[test]
    fn duplicate_ids_renumber_suite() {
        let (cases, renumbered) =
            normalize_eval_ids(SuiteVersion::V2, vec![case("v2-case-0001"), case("v2-case-0001")]);
        assert!(renumbered);
        assert_eq!(ids(&cases), vec!["v2-case-0001", "v2-case-0002"]);
    }

    #[test]
    fn five_digit_suffix_is_malformed() {
        assert!(!is_well_formed("v1-case-00001"));
        assert!(is_well_formed("v12-case-0001"));
    }
}
