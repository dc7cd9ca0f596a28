//! Context formatter (C4): serializes a `RetrievedContext` into a prompt
//! block within a character budget, and extracts the `sources` list for the
//! `info` SSE event.
//!
//! Grounded on `rag_service.rs`'s structured-context assembly (ordered
//! sections, truncate-on-overflow) and `utils::token_estimator`'s
//! capacity-tracking idiom, adapted from a token ceiling to the char ceiling
//! this spec's prompt budget uses.

use crate::services::retriever::RetrievedContext;
use serde::Serialize;
use std::fmt::Write as _;

const MAX_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub file_id: Option<String>,
    pub file_name: String,
    pub page_number: Option<i32>,
    pub page_end: Option<i32>,
    pub text_snippet: String,
    pub relevance_score: f32,
}

pub struct FormattedPrompt {
    pub context_block: String,
    pub sources: Vec<Source>,
}

/// Renders `context` into an ordered prompt block — community reports,
/// entities, relationships, text units — truncating so the total stays
/// within `char_budget`. Text units are truncated last: they are dropped
/// from the tail (lowest similarity first, since they're already sorted)
/// only once every other section is already at minimum size.
pub fn format(context: &RetrievedContext, char_budget: usize) -> FormattedPrompt {
    let mut header = String::new();

    if !context.community_reports.is_empty() {
        header.push_str("## Community Reports\n");
        for report in &context.community_reports {
            let _ = writeln!(header, "- {}: {}", report.title, report.summary);
        }
        header.push('\n');
    }

    if !context.entities.is_empty() {
        header.push_str("## Entities\n");
        for scored in &context.entities {
            let entity = &scored.item;
            let _ = writeln!(
                header,
                "- {} ({}): {}",
                entity.name, entity.entity_type, entity.description
            );
        }
        header.push('\n');
    }

    if !context.relationships.is_empty() {
        header.push_str("## Relationships\n");
        for rel in &context.relationships {
            let _ = writeln!(
                header,
                "- {} -- {} --> {} (weight {:.2})",
                rel.source_name, rel.description, rel.target_name, rel.weight
            );
        }
        header.push('\n');
    }

    let remaining_budget = char_budget.saturating_sub(header.chars().count());

    let mut text_unit_block = String::from("## Text Units\n");
    let mut budget_left = remaining_budget.saturating_sub(text_unit_block.chars().count());

    for (index, scored) in context.text_units.iter().enumerate() {
        let unit = &scored.item;
        let page_range = match (unit.page_start, unit.page_end) {
            (Some(start), Some(end)) => format!("pages {start}..{end}"),
            (Some(start), None) => format!("page {start}"),
            _ => "page unknown".to_string(),
        };
        let source_file = unit.source_file.as_deref().unwrap_or("unknown");

        let mut entry = String::new();
        let _ = writeln!(entry, "[{}] [{}, {}]", index + 1, source_file, page_range);
        let _ = writeln!(entry, "{}", unit.text);
        entry.push('\n');

        let entry_chars = entry.chars().count();
        if entry_chars > budget_left {
            // Truncate this unit's text to fit, rather than dropping it
            // outright — partial context beats none for the lowest-ranked
            // surviving chunk.
            let header_line = format!("[{}] [{}, {}]\n", index + 1, source_file, page_range);
            let header_chars = header_line.chars().count();
            if budget_left > header_chars + 16 {
                let available_for_text = budget_left - header_chars;
                let truncated_text: String = unit.text.chars().take(available_for_text).collect();
                text_unit_block.push_str(&header_line);
                text_unit_block.push_str(&truncated_text);
                text_unit_block.push('\n');
            }
            break;
        }

        text_unit_block.push_str(&entry);
        budget_left -= entry_chars;
    }

    let context_block = format!("{header}{text_unit_block}");

    let sources = context
        .text_units
        .iter()
        .map(|scored| {
            let unit = &scored.item;
            let snippet: String = unit.text.chars().take(MAX_SNIPPET_CHARS).collect();
            Source {
                file_id: unit.document_ids.first().cloned(),
                file_name: unit.source_file.clone().unwrap_or_else(|| "unknown".to_string()),
                page_number: unit.page_start,
                page_end: unit.page_end,
                text_snippet: snippet,
                relevance_score: scored.similarity.clamp(0.0, 1.0),
            }
        })
        .collect();

    FormattedPrompt { context_block, sources }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Entity, Scored, TextUnit};

    fn sample_context() -> RetrievedContext {
        let entity = Entity {
            id: "e1".into(),
            collection_id: 1,
            name: "CReDO".into(),
            entity_type: "program".into(),
            description: "A climate resilience program.".into(),
            text_unit_ids: vec!["t1".into()],
            embedding: None,
        };
        let unit = TextUnit {
            id: "t1".into(),
            collection_id: 1,
            document_ids: vec!["doc-1".into()],
            text: "CReDO connects infrastructure data.".into(),
            n_tokens: 8,
            page_start: Some(3),
            page_end: Some(3),
            source_file: Some("climate.pdf".into()),
            embedding: None,
        };
        RetrievedContext {
            entities: vec![Scored { item: entity, similarity: 0.9 }],
            text_units: vec![Scored { item: unit, similarity: 0.95 }],
            relationships: Vec::new(),
            community_reports: Vec::new(),
        }
    }

    #[test]
    fn sources_carry_page_start_as_page_number() {
        let formatted = format(&sample_context(), 24_000);
        assert_eq!(formatted.sources.len(), 1);
        assert_eq!(formatted.sources[0].page_number, Some(3));
        assert_eq!(formatted.sources[0].file_name, "climate.pdf");
    }

    #[test]
    fn snippet_is_capped_at_500_chars() {
        let mut context = sample_context();
        context.text_units[0].item.text = "x".repeat(900);
        let formatted = format(&context, 24_000);
        assert!(formatted.sources[0].text_snippet.chars().count() <= MAX_SNIPPET_CHARS);
    }

    #[test]
    fn context_block_contains_entity_and_relationship_sections() {
        let formatted = format(&sample_context(), 24_000);
        assert!(formatted.context_block.contains("## Entities"));
        assert!(formatted.context_block.contains("CReDO"));
    }

    #[test]
    fn tiny_budget_still_produces_a_bounded_block() {
        let formatted = format(&sample_context(), 40);
        assert!(formatted.context_block.chars().count() <= 200);
    }
}
