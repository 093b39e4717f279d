//! Address Validator (§4.4): normalizes and validates a postal address
//! against a vendor, optionally handing off to CG for AI-assisted repair
//! when the vendor result is low-granularity and repair is enabled.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cg::{AddressRepairInput, Classifier};
use crate::domain::{Address, ValidatedAddress};

const DEFAULT_SOFT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    Unknown,
    Locality,
    Street,
    Route,
    Premise,
}

#[derive(Debug, Clone)]
pub struct VendorResult {
    pub formatted: String,
    pub components: Address,
    pub confidence: f64,
    pub verdict: String,
    pub granularity: Granularity,
}

#[async_trait]
pub trait AddressVendor: Send + Sync {
    async fn validate(&self, raw: &str) -> anyhow::Result<VendorResult>;
}

pub struct HttpAddressVendor {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpAddressVendor {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self { http: reqwest::Client::new(), base_url, api_key }
    }
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    address: &'a str,
}

#[derive(Deserialize)]
struct ValidateResponse {
    formatted: String,
    line1: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip: Option<String>,
    country: Option<String>,
    confidence: f64,
    verdict: String,
    granularity: String,
}

fn parse_granularity(s: &str) -> Granularity {
    match s {
        "PREMISE" => Granularity::Premise,
        "ROUTE" => Granularity::Route,
        "STREET" => Granularity::Street,
        "LOCALITY" => Granularity::Locality,
        _ => Granularity::Unknown,
    }
}

#[async_trait]
impl AddressVendor for HttpAddressVendor {
    async fn validate(&self, raw: &str) -> anyhow::Result<VendorResult> {
        let resp: ValidateResponse = self
            .http
            .post(format!("{}/validate", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ValidateRequest { address: raw })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(VendorResult {
            formatted: resp.formatted,
            components: Address { line1: resp.line1, city: resp.city, state: resp.state, zip: resp.zip, country: resp.country },
            confidence: resp.confidence,
            verdict: resp.verdict,
            granularity: parse_granularity(&resp.granularity),
        })
    }
}

pub struct AddressValidatorConfig {
    pub soft_deadline: Duration,
    pub enable_ai_address_repair: bool,
}

impl Default for AddressValidatorConfig {
    fn default() -> Self {
        Self { soft_deadline: DEFAULT_SOFT_DEADLINE, enable_ai_address_repair: false }
    }
}

/// Validates one address. On soft-deadline expiry returns a `skipped` result
/// with the raw input preserved rather than failing the record (§4.4).
pub async fn validate_address(
    vendor: &dyn AddressVendor,
    classifier: &dyn Classifier,
    raw_address: &str,
    config: &AddressValidatorConfig,
) -> ValidatedAddress {
    let vendor_call = vendor.validate(raw_address);
    let vendor_result = match tokio::time::timeout(config.soft_deadline, vendor_call).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "address vendor call failed");
            return ValidatedAddress {
                formatted: Some(raw_address.to_string()),
                components: None,
                confidence: None,
                verdict: Some("skipped".to_string()),
                enhancement_used: false,
                enhancement_strategy: None,
                enhancement_reasoning: None,
            };
        }
        Err(_) => {
            tracing::warn!("address validation exceeded soft deadline");
            return ValidatedAddress {
                formatted: Some(raw_address.to_string()),
                components: None,
                confidence: None,
                verdict: Some("skipped".to_string()),
                enhancement_used: false,
                enhancement_strategy: None,
                enhancement_reasoning: None,
            };
        }
    };

    let mut enhancement_used = false;
    let mut enhancement_strategy = None;
    let mut enhancement_reasoning = None;
    let mut formatted = vendor_result.formatted.clone();

    if config.enable_ai_address_repair && vendor_result.granularity < Granularity::Route {
        let repair_input = AddressRepairInput { raw_address: raw_address.to_string(), vendor_verdict: vendor_result.verdict.clone() };
        match classifier.repair_address(&repair_input).await {
            Ok(repair) => {
                if let Some(corrected) = repair.corrected {
                    formatted = corrected;
                    enhancement_used = true;
                    enhancement_strategy = Some("ai_address_repair".to_string());
                }
                enhancement_reasoning = Some(repair.reasoning);
            }
            Err(e) => {
                tracing::warn!(error = %e, "AI address repair failed, keeping vendor result");
            }
        }
    }

    ValidatedAddress {
        formatted: Some(formatted),
        components: Some(vendor_result.components),
        confidence: Some(vendor_result.confidence),
        verdict: Some(vendor_result.verdict),
        enhancement_used,
        enhancement_strategy,
        enhancement_reasoning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cg::{AdjudicationInput, AdjudicationOutput, AddressRepairOutput, ClassifyInput, ClassifyOutput};

    struct SlowVendor;
    #[async_trait]
    impl AddressVendor for SlowVendor {
        async fn validate(&self, _: &str) -> anyhow::Result<VendorResult> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            unreachable!()
        }
    }

    struct NoopClassifier;
    #[async_trait]
    impl Classifier for NoopClassifier {
        async fn classify(&self, _: &ClassifyInput) -> anyhow::Result<ClassifyOutput> {
            unreachable!()
        }
        async fn adjudicate_match(&self, _: &AdjudicationInput) -> anyhow::Result<AdjudicationOutput> {
            unreachable!()
        }
        async fn repair_address(&self, _: &AddressRepairInput) -> anyhow::Result<AddressRepairOutput> {
            Ok(AddressRepairOutput { corrected: Some("123 Fixed St".to_string()), reasoning: "fixed typo".to_string() })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn soft_deadline_yields_skipped() {
        let config = AddressValidatorConfig { soft_deadline: Duration::from_millis(10), enable_ai_address_repair: false };
        let handle = tokio::spawn(async move { validate_address(&SlowVendor, &NoopClassifier, "123 Main St", &config).await });
        tokio::time::advance(Duration::from_millis(20)).await;
        let result = handle.await.unwrap();
        assert_eq!(result.verdict.as_deref(), Some("skipped"));
        assert_eq!(result.formatted.as_deref(), Some("123 Main St"));
    }
}
