use rust_decimal::Decimal;
use url::Url;

use crate::domains::crawl_jobs::models::{CrawlResult, SourceKind};

/// Configurable predicate gating promotion of a result into price history.
///
/// Empty allow-lists accept everything.
#[derive(Debug, Clone)]
pub struct EligibilityPolicy {
    pub enabled: bool,
    pub require_in_stock: bool,
    /// Lowercase hosts; subdomains of a listed host are accepted too.
    pub allowed_domains: Vec<String>,
    /// Uppercase ISO codes.
    pub allowed_currencies: Vec<String>,
    /// At least one reading must come from one of these.
    pub allowed_sources: Vec<SourceKind>,
    /// Applied only when an ML reading is present.
    pub min_ml_confidence: f64,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            require_in_stock: true,
            allowed_domains: Vec::new(),
            allowed_currencies: Vec::new(),
            allowed_sources: Vec::new(),
            min_ml_confidence: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(String),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Eligibility::Eligible => None,
            Eligibility::Ineligible(reason) => Some(reason),
        }
    }
}

fn host_of(target_ref: &str) -> Option<String> {
    Url::parse(target_ref)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
}

impl EligibilityPolicy {
    /// Cheap synchronous check run when the result is created.
    pub fn evaluate(&self, result: &CrawlResult) -> Eligibility {
        if !self.enabled {
            return Eligibility::Ineligible("auto-record disabled".into());
        }
        if !result.succeeded {
            return Eligibility::Ineligible("crawl did not succeed".into());
        }
        if self.require_in_stock && !result.in_stock {
            return Eligibility::Ineligible("out of stock".into());
        }
        if result.price <= Decimal::ZERO {
            return Eligibility::Ineligible("no usable price".into());
        }

        if !self.allowed_domains.is_empty() {
            let Some(host) = host_of(&result.target_ref) else {
                return Eligibility::Ineligible(format!(
                    "target {} has no host",
                    result.target_ref
                ));
            };
            let allowed = self
                .allowed_domains
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{}", d)));
            if !allowed {
                return Eligibility::Ineligible(format!("domain {} not allowed", host));
            }
        }

        let currency = result.currency.to_uppercase();
        if !self.allowed_currencies.is_empty() && !self.allowed_currencies.contains(&currency) {
            return Eligibility::Ineligible(format!("currency {} not allowed", currency));
        }

        let payload = &result.structured_payload.0;
        if !self.allowed_sources.is_empty()
            && !self.allowed_sources.iter().any(|kind| payload.has_source(*kind))
        {
            return Eligibility::Ineligible("no allowed extraction source".into());
        }

        if let Some(confidence) = payload.ml_confidence() {
            if confidence < self.min_ml_confidence {
                return Eligibility::Ineligible(format!(
                    "ml confidence {:.2} below {:.2}",
                    confidence, self.min_ml_confidence
                ));
            }
        }

        Eligibility::Eligible
    }
}
