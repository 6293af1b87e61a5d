use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node};
use url::Url;

use super::{all_elements, descendant_elements, has_class_token_ci, is_tag};

static PAGE_QUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[?&](page|p)=(\d+)").unwrap());

const MAX_RECONSTRUCTED_PAGE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStrategy {
    /// Links inside a `nav`, else a `ul`/`ol`, whose class carries the marker.
    Container,
    /// Anchors whose `href` carries a `page`/`p` query parameter.
    QueryPattern,
    /// Page numbers rendered as bare text, rebuilt as `?page=N` links.
    Reconstruction,
}

impl PaginationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::QueryPattern => "query_pattern",
            Self::Reconstruction => "reconstruction",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationDiscovery {
    pub urls: Vec<String>,
    pub strategy: Option<PaginationStrategy>,
}

/// Try the three link strategies in order and return the first non-empty result.
pub fn discover_page_urls(raw: &str, page_url: &str, container_marker: &str) -> PaginationDiscovery {
    let document = Html::parse_document(raw);
    let origin = origin_of(page_url);

    let urls = container_links(&document, origin.as_ref(), container_marker);
    if !urls.is_empty() {
        return found(PaginationStrategy::Container, urls);
    }

    let urls = query_pattern_links(&document, origin.as_ref());
    if !urls.is_empty() {
        return found(PaginationStrategy::QueryPattern, urls);
    }

    let urls = reconstructed_links(&document, page_url);
    if !urls.is_empty() {
        return found(PaginationStrategy::Reconstruction, urls);
    }

    PaginationDiscovery::default()
}

fn found(strategy: PaginationStrategy, urls: Vec<String>) -> PaginationDiscovery {
    tracing::debug!(strategy = strategy.as_str(), count = urls.len(), "pagination links");
    PaginationDiscovery {
        urls,
        strategy: Some(strategy),
    }
}

/// `scheme://host[:port]/` of the page, used as the join base for hrefs.
fn origin_of(page_url: &str) -> Option<Url> {
    let mut url = Url::parse(page_url).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Some(url)
}

fn container_links(document: &Html, origin: Option<&Url>, marker: &str) -> Vec<String> {
    let marker = marker.to_lowercase();
    if marker.is_empty() {
        return Vec::new();
    }
    let marked = |tags: &[&str]| {
        all_elements(document)
            .find(|el| is_tag(el, tags) && has_class_token_ci(el, &[marker.as_str()]))
    };
    let Some(container) = marked(&["nav"][..]).or_else(|| marked(&["ul", "ol"][..])) else {
        return Vec::new();
    };

    let hrefs = descendant_elements(&container)
        .filter(|el| is_tag(el, &["a"]))
        .filter_map(|el| el.value().attr("href"));
    resolve_unique(hrefs, origin)
}

fn query_pattern_links(document: &Html, origin: Option<&Url>) -> Vec<String> {
    let hrefs = all_elements(document)
        .filter(|el| is_tag(el, &["a"]))
        .filter_map(|el| el.value().attr("href"))
        .filter(|href| PAGE_QUERY.is_match(href));
    resolve_unique(hrefs, origin)
}

fn reconstructed_links(document: &Html, page_url: &str) -> Vec<String> {
    let pages = all_elements(document)
        .filter(|el| is_tag(el, &["span", "a", "div"]))
        .filter_map(sole_string)
        .filter_map(page_number)
        .collect::<BTreeSet<_>>();

    let separator = if page_url.contains('?') { '&' } else { '?' };
    pages
        .into_iter()
        .map(|n| format!("{page_url}{separator}page={n}"))
        .collect()
}

/// The text of an element whose only content is a single text node, possibly
/// nested through single-child elements.
fn sole_string(element: ElementRef<'_>) -> Option<&str> {
    let mut children = element.children();
    let only = children.next()?;
    if children.next().is_some() {
        return None;
    }
    match only.value() {
        Node::Text(text) => Some(&**text),
        Node::Element(_) => ElementRef::wrap(only).and_then(sole_string),
        _ => None,
    }
}

fn page_number(text: &str) -> Option<u32> {
    if text.is_empty() || text.trim().len() >= 5 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n = text.parse::<u32>().ok()?;
    (1..=MAX_RECONSTRUCTED_PAGE).contains(&n).then_some(n)
}

fn resolve_unique<'a>(hrefs: impl Iterator<Item = &'a str>, origin: Option<&Url>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for href in hrefs {
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        let resolved = match origin {
            Some(base) => base.join(href),
            None => Url::parse(href),
        };
        let Ok(resolved) = resolved else {
            continue;
        };
        let resolved = resolved.to_string();
        if seen.insert(resolved.clone()) {
            urls.push(resolved);
        }
    }
    urls
}
