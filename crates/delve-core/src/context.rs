//! Deterministic assembly of the prompt sent to the research agent.

use crate::model::{DocumentStatus, UploadedDocument};

pub const FINDINGS_HEADER: &str = "=== Previous research findings ===";
pub const NO_REPEAT_INSTRUCTION: &str = "Instruction: build on the findings above and do not repeat topics already covered above.";
const REFERENCE_PREFIX: &str = "=== Reference material:";

/// A processed document's contribution to the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentContext {
    pub name: String,
    pub summary: String,
}

impl DocumentContext {
    pub fn new(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: summary.into(),
        }
    }
}

/// Compose the enhanced query.
///
/// The query comes first, verbatim. An ancestor summary adds a findings
/// block and the no-repeat instruction; each document adds a reference
/// block in the order given. With neither, the query is returned as is.
pub fn compose(
    original_query: &str,
    ancestor_summary: Option<&str>,
    documents: &[DocumentContext],
) -> String {
    let mut enhanced = String::from(original_query);

    if let Some(summary) = ancestor_summary {
        enhanced.push_str("\n\n");
        enhanced.push_str(FINDINGS_HEADER);
        enhanced.push('\n');
        enhanced.push_str(summary.trim());
        enhanced.push_str("\n\n");
        enhanced.push_str(NO_REPEAT_INSTRUCTION);
    }

    for document in documents {
        enhanced.push_str("\n\n");
        enhanced.push_str(REFERENCE_PREFIX);
        enhanced.push(' ');
        enhanced.push_str(&document.name);
        enhanced.push_str(" ===\n");
        enhanced.push_str(document.summary.trim());
    }

    enhanced
}

/// Select the documents that may contribute context, preserving upload order.
///
/// Anything not yet `processed` (or processed without a summary) is skipped.
pub fn document_contexts(documents: &[UploadedDocument]) -> Vec<DocumentContext> {
    documents
        .iter()
        .filter(|doc| doc.status == DocumentStatus::Processed)
        .filter_map(|doc| {
            doc.summary
                .as_ref()
                .map(|summary| DocumentContext::new(doc.name.clone(), summary.clone()))
        })
        .collect()
}
