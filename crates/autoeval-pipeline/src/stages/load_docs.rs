//! Load the corpus and resolve document bodies.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use autoeval_types::{Document, Result};

use crate::records::{list_documents, load_document_text};
use crate::state::{HaltReason, RunState, StatePatch};

use super::StageContext;

/// Pick `corpus_size` documents deterministically from `seed`.
///
/// `docs` must already be ordered by `doc_id`; the sample is returned in the
/// same order. A corpus no larger than `corpus_size` is returned whole.
pub fn sample_corpus(docs: Vec<Document>, corpus_size: usize, seed: u64) -> Vec<Document> {
    if docs.len() <= corpus_size {
        return docs;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sample: Vec<Document> = docs.choose_multiple(&mut rng, corpus_size).cloned().collect();
    sample.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
    sample
}

pub async fn run(ctx: &StageContext<'_>, state: &RunState) -> Result<StatePatch> {
    let all = list_documents(ctx.store()).await?;
    if all.is_empty() {
        let msg = "load_docs: corpus is empty, ingest documents before starting a run";
        tracing::error!(run_id = %state.run_id, "Corpus is empty");
        return Ok(StatePatch::new()
            .error(msg)
            .halt(HaltReason::Fatal(msg.to_string())));
    }

    let total = all.len();
    let selected = sample_corpus(all, state.config.corpus_size, state.config.seed);
    let data_dir = &ctx.settings().data_dir;

    let mut docs = Vec::with_capacity(selected.len());
    let mut errors = Vec::new();
    for mut doc in selected {
        match load_document_text(&doc, data_dir).await {
            Ok(text) => {
                doc.text = text;
                docs.push(doc);
            }
            Err(e) => {
                tracing::warn!(run_id = %state.run_id, doc_id = %doc.doc_id, error = %e, "Skipping unreadable document");
                errors.push(format!("load_docs: {e}"));
            }
        }
    }

    if docs.is_empty() {
        let msg = "load_docs: no readable documents in the sampled corpus";
        tracing::error!(run_id = %state.run_id, "No readable documents");
        return Ok(StatePatch::new()
            .errors(errors)
            .error(msg)
            .halt(HaltReason::Fatal(msg.to_string())));
    }

    tracing::info!(
        run_id = %state.run_id,
        available = total,
        loaded = docs.len(),
        "Loaded corpus"
    );
    Ok(StatePatch::new().docs(docs).errors(errors))
}
