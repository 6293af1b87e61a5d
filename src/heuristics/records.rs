use scraper::{ElementRef, Html};

use super::{
    ItemMarkers, all_elements, descendant_elements, has_class_token, has_class_token_ci, is_tag,
    stripped_text,
};
use crate::schema::{Record, RecordSchema};

struct SynonymGroup {
    fields: &'static [&'static str],
    tags: &'static [&'static str],
    class_markers: &'static [&'static str],
}

const SYNONYM_GROUPS: [SynonymGroup; 3] = [
    SynonymGroup {
        fields: &["product_name", "product", "name", "title"],
        tags: &["h2", "h3", "h4", "div"],
        class_markers: &["name", "title"],
    },
    SynonymGroup {
        fields: &["price", "cost", "amount"],
        tags: &["span", "div"],
        class_markers: &["price", "cost"],
    },
    SynonymGroup {
        fields: &["brand", "manufacturer", "vendor"],
        tags: &["span", "div"],
        class_markers: &["brand", "vendor"],
    },
];

const GENERIC_TAGS: &[&str] = &["div", "span", "p"];

/// Scan `raw` for listing cards and resolve each schema field inside every card.
///
/// Cards whose fields all resolve to empty strings are dropped. An empty vec
/// means "nothing found" and lets the caller fall through to the next strategy.
pub fn extract_records(raw: &str, schema: &RecordSchema, items: &ItemMarkers) -> Vec<Record> {
    let document = Html::parse_document(raw);
    let cards = find_cards(&document, items);
    if cards.is_empty() {
        return Vec::new();
    }
    tracing::debug!(cards = cards.len(), "listing card candidates");

    cards
        .iter()
        .map(|card| resolve_record(card, schema))
        .filter(Record::has_any_value)
        .collect()
}

fn find_cards<'a>(document: &'a Html, items: &ItemMarkers) -> Vec<ElementRef<'a>> {
    let test_id = items.test_id.to_lowercase();

    let by_card_class = |el: &ElementRef<'_>| {
        is_tag(el, &["div"])
            && has_class_token(el, |token| {
                items
                    .card_classes
                    .iter()
                    .any(|marker| !marker.is_empty() && token.contains(marker.as_str()))
            })
    };
    let by_detail_link = |el: &ElementRef<'_>| {
        !items.detail_path.is_empty()
            && is_tag(el, &["a"])
            && el
                .value()
                .attr("href")
                .is_some_and(|href| href.contains(items.detail_path.as_str()))
    };
    let by_test_id = |el: &ElementRef<'_>| {
        !test_id.is_empty()
            && is_tag(el, &["div", "a"])
            && el
                .value()
                .attr("data-testid")
                .is_some_and(|id| id.to_lowercase().contains(test_id.as_str()))
    };

    let matchers: [&dyn Fn(&ElementRef<'_>) -> bool; 3] =
        [&by_card_class, &by_detail_link, &by_test_id];
    for matcher in matchers {
        let found = all_elements(document)
            .filter(|el| matcher(el))
            .collect::<Vec<_>>();
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

fn resolve_record(card: &ElementRef<'_>, schema: &RecordSchema) -> Record {
    let mut record = Record::default();
    for name in schema.field_names() {
        record.push(name, resolve_field(card, name));
    }
    record
}

fn resolve_field(card: &ElementRef<'_>, field: &str) -> String {
    let field = field.to_lowercase();

    let synonym = SYNONYM_GROUPS
        .iter()
        .find(|group| group.fields.contains(&field.as_str()))
        .and_then(|group| first_match(card, group.tags, group.class_markers))
        .map(|el| stripped_text(&el))
        .unwrap_or_default();
    if !synonym.is_empty() {
        return synonym;
    }

    first_match(card, GENERIC_TAGS, &[field.as_str()])
        .map(|el| stripped_text(&el))
        .unwrap_or_default()
}

fn first_match<'a>(
    card: &ElementRef<'a>,
    tags: &[&str],
    class_markers: &[&str],
) -> Option<ElementRef<'a>> {
    descendant_elements(card).find(|el| is_tag(el, tags) && has_class_token_ci(el, class_markers))
}
