//! Deterministic extractors that run before any model call.
//!
//! Each registered [`DomainProfile`] names the structural markers a site uses
//! for listing cards and pagination. The strategies here only apply to URLs
//! whose host matches a registered profile.

pub mod pagination;
pub mod records;

use std::sync::Arc;

use async_trait::async_trait;
use scraper::{ElementRef, Html};
use url::Url;

use crate::chain::{Attempt, Page, Provenance, Strategy};
use crate::error::PipelineError;
use crate::schema::{PaginationQuery, Record, RecordSchema};

/// Markers that identify one listing card in a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMarkers {
    /// Matched case-sensitively against each class token of `div` elements.
    pub card_classes: Vec<String>,
    /// Substring of `href` on anchors pointing at a detail page.
    pub detail_path: String,
    /// Case-insensitive substring of a `data-testid` attribute.
    pub test_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainProfile {
    pub host_marker: String,
    pub items: ItemMarkers,
    pub pagination_marker: String,
}

impl DomainProfile {
    /// Product-card layout used by marketplace listing pages.
    pub fn listing_cards(host_marker: impl Into<String>) -> Self {
        Self {
            host_marker: host_marker.into(),
            items: ItemMarkers {
                card_classes: vec!["product-card".to_owned(), "ProductCard".to_owned()],
                detail_path: "/product/".to_owned(),
                test_id: "product".to_owned(),
            },
            pagination_marker: "pagination".to_owned(),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        if self.host_marker.is_empty() {
            return false;
        }
        match Url::parse(url) {
            Ok(parsed) => parsed
                .host_str()
                .is_some_and(|host| host.contains(self.host_marker.as_str())),
            Err(_) => url.contains(self.host_marker.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicRegistry {
    profiles: Vec<DomainProfile>,
}

impl HeuristicRegistry {
    pub fn builtin() -> Self {
        Self {
            profiles: vec![DomainProfile::listing_cards("weedmaps.com")],
        }
    }

    pub fn register(&mut self, profile: DomainProfile) {
        self.profiles.push(profile);
    }

    pub fn with_listing_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for host in hosts {
            self.register(DomainProfile::listing_cards(host));
        }
        self
    }

    pub fn profile_for(&self, url: &str) -> Option<&DomainProfile> {
        self.profiles.iter().find(|profile| profile.matches(url))
    }
}

pub struct ListingCardHeuristic {
    registry: Arc<HeuristicRegistry>,
}

impl ListingCardHeuristic {
    pub fn new(registry: Arc<HeuristicRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Strategy<RecordSchema, Record> for ListingCardHeuristic {
    fn name(&self) -> &'static str {
        "listing_cards"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Heuristic
    }

    fn applies_to(&self, url: &str) -> bool {
        self.registry.profile_for(url).is_some()
    }

    async fn attempt(
        &self,
        page: &Page<'_>,
        schema: &RecordSchema,
    ) -> Result<Attempt<Record>, PipelineError> {
        let Some(profile) = self.registry.profile_for(page.url) else {
            return Ok(Attempt::empty());
        };
        let records = records::extract_records(page.raw, schema, &profile.items);
        Ok(Attempt::found(records))
    }
}

pub struct PaginationLinkHeuristic {
    registry: Arc<HeuristicRegistry>,
}

impl PaginationLinkHeuristic {
    pub fn new(registry: Arc<HeuristicRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Strategy<PaginationQuery, String> for PaginationLinkHeuristic {
    fn name(&self) -> &'static str {
        "pagination_links"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Heuristic
    }

    fn applies_to(&self, url: &str) -> bool {
        self.registry.profile_for(url).is_some()
    }

    async fn attempt(
        &self,
        page: &Page<'_>,
        _query: &PaginationQuery,
    ) -> Result<Attempt<String>, PipelineError> {
        let Some(profile) = self.registry.profile_for(page.url) else {
            return Ok(Attempt::empty());
        };
        let discovery =
            pagination::discover_page_urls(page.raw, page.url, &profile.pagination_marker);
        let strategy = discovery.strategy.map(|s| s.as_str());
        Ok(Attempt::found(discovery.urls).with_detail(strategy))
    }
}

fn all_elements(document: &Html) -> impl Iterator<Item = ElementRef<'_>> {
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
}

/// Descendants of `element`, excluding the element itself, in document order.
fn descendant_elements<'a>(element: &ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    element.descendants().skip(1).filter_map(ElementRef::wrap)
}

fn is_tag(element: &ElementRef<'_>, tags: &[&str]) -> bool {
    tags.contains(&element.value().name())
}

fn has_class_token(element: &ElementRef<'_>, pred: impl Fn(&str) -> bool) -> bool {
    element.value().classes().any(pred)
}

fn has_class_token_ci(element: &ElementRef<'_>, markers: &[&str]) -> bool {
    has_class_token(element, |token| {
        let token = token.to_lowercase();
        markers.iter().any(|marker| token.contains(marker))
    })
}

/// Text nodes of `element`, each trimmed, concatenated without separators.
fn stripped_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
