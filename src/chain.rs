//! Ordered strategy evaluation with a model call as the last resort.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::usage::Usage;

/// Which kind of strategy produced an accepted result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Heuristic,
    Model,
}

/// A fetched page handed to each strategy.
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    pub url: &'a str,
    pub raw: &'a str,
}

#[derive(Debug, Clone)]
pub struct Attempt<T> {
    pub items: Vec<T>,
    pub usage: Usage,
    /// Strategy-specific label for how the items were found.
    pub detail: Option<&'static str>,
}

impl<T> Attempt<T> {
    pub fn empty() -> Self {
        Self::found(Vec::new())
    }

    pub fn found(items: Vec<T>) -> Self {
        Self {
            items,
            usage: Usage::ZERO,
            detail: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_detail(mut self, detail: Option<&'static str>) -> Self {
        self.detail = detail;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
pub trait Strategy<Q, T>: Send + Sync
where
    Q: Sync,
    T: Send,
{
    fn name(&self) -> &'static str;

    fn provenance(&self) -> Provenance;

    fn applies_to(&self, _url: &str) -> bool {
        true
    }

    async fn attempt(&self, page: &Page<'_>, query: &Q) -> Result<Attempt<T>, PipelineError>;
}

/// The outcome the chain settled on for one page.
#[derive(Debug, Clone)]
pub struct Accepted<T> {
    pub items: Vec<T>,
    pub provenance: Provenance,
    pub strategy: &'static str,
    pub detail: Option<&'static str>,
    /// Summed over every strategy that ran, not only the accepted one.
    pub usage: Usage,
}

/// Heuristics in registration order, then the model.
///
/// The first heuristic that applies to the URL and returns a non-empty result
/// wins. The model result is accepted as-is, even when empty.
pub struct FallbackChain<Q, T> {
    heuristics: Vec<Arc<dyn Strategy<Q, T>>>,
    model: Arc<dyn Strategy<Q, T>>,
}

impl<Q, T> FallbackChain<Q, T>
where
    Q: Sync,
    T: Send,
{
    pub fn new(model: Arc<dyn Strategy<Q, T>>) -> Self {
        Self {
            heuristics: Vec::new(),
            model,
        }
    }

    pub fn with_heuristic(mut self, strategy: Arc<dyn Strategy<Q, T>>) -> Self {
        self.heuristics.push(strategy);
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.heuristics
            .iter()
            .map(|s| s.name())
            .chain(std::iter::once(self.model.name()))
            .collect()
    }

    pub async fn run(&self, page: &Page<'_>, query: &Q) -> Result<Accepted<T>, PipelineError> {
        let mut usage = Usage::ZERO;

        for strategy in &self.heuristics {
            if !strategy.applies_to(page.url) {
                continue;
            }
            let attempt = strategy.attempt(page, query).await?;
            usage += attempt.usage;
            if !attempt.is_empty() {
                tracing::info!(
                    url = page.url,
                    strategy = strategy.name(),
                    items = attempt.items.len(),
                    "heuristic accepted"
                );
                return Ok(Accepted {
                    items: attempt.items,
                    provenance: strategy.provenance(),
                    strategy: strategy.name(),
                    detail: attempt.detail,
                    usage,
                });
            }
            tracing::debug!(
                url = page.url,
                strategy = strategy.name(),
                "heuristic found nothing"
            );
        }

        let attempt = self.model.attempt(page, query).await?;
        usage += attempt.usage;
        tracing::info!(
            url = page.url,
            strategy = self.model.name(),
            items = attempt.items.len(),
            input_tokens = attempt.usage.input_tokens,
            output_tokens = attempt.usage.output_tokens,
            "model fallback used"
        );
        Ok(Accepted {
            items: attempt.items,
            provenance: self.model.provenance(),
            strategy: self.model.name(),
            detail: attempt.detail,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Fixed {
        name: &'static str,
        provenance: Provenance,
        host: Option<&'static str>,
        items: Vec<&'static str>,
        usage: Usage,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn heuristic(name: &'static str, host: &'static str, items: Vec<&'static str>) -> Self {
            Self {
                name,
                provenance: Provenance::Heuristic,
                host: Some(host),
                items,
                usage: Usage::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn model(items: Vec<&'static str>, usage: Usage) -> Self {
            Self {
                name: "model",
                provenance: Provenance::Model,
                host: None,
                items,
                usage,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Strategy<(), String> for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn provenance(&self) -> Provenance {
            self.provenance
        }

        fn applies_to(&self, url: &str) -> bool {
            self.host.is_none_or(|host| url.contains(host))
        }

        async fn attempt(&self, _page: &Page<'_>, _query: &()) -> Result<Attempt<String>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items = self.items.iter().map(|s| s.to_string()).collect();
            Ok(Attempt::found(items).with_usage(self.usage))
        }
    }

    fn page(url: &str) -> Page<'_> {
        Page { url, raw: "<html></html>" }
    }

    #[tokio::test]
    async fn first_non_empty_heuristic_wins_without_model_call() -> anyhow::Result<()> {
        let empty = Arc::new(Fixed::heuristic("empty", "shop.example", vec![]));
        let full = Arc::new(Fixed::heuristic("full", "shop.example", vec!["a", "b"]));
        let model = Arc::new(Fixed::model(vec!["m"], Usage::new(10, 2, 0.1)));
        let chain = FallbackChain::new(model.clone())
            .with_heuristic(empty.clone())
            .with_heuristic(full.clone());

        let accepted = chain.run(&page("https://shop.example/list"), &()).await?;
        assert_eq!(accepted.items, ["a", "b"]);
        assert_eq!(accepted.provenance, Provenance::Heuristic);
        assert_eq!(accepted.strategy, "full");
        assert!(accepted.usage.is_zero());
        assert_eq!(empty.calls.load(Ordering::SeqCst), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn model_runs_when_no_heuristic_applies_and_empty_is_accepted() -> anyhow::Result<()> {
        let heuristic = Arc::new(Fixed::heuristic("h", "shop.example", vec!["x"]));
        let model = Arc::new(Fixed::model(vec![], Usage::new(7, 3, 0.02)));
        let chain = FallbackChain::new(model.clone()).with_heuristic(heuristic.clone());

        let accepted = chain.run(&page("https://other.example/"), &()).await?;
        assert!(accepted.items.is_empty());
        assert_eq!(accepted.provenance, Provenance::Model);
        assert_eq!(accepted.usage, Usage::new(7, 3, 0.02));
        assert_eq!(heuristic.calls.load(Ordering::SeqCst), 0);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.strategy_names(), ["h", "model"]);
        Ok(())
    }
}
