//! Classifier Gateway (§4.3): a single-request, rate-limited HTTP
//! collaborator producing `{payee_type, confidence, sic_code, reasoning}`,
//! plus the "match adjudication" and "address repair" sub-operations used by
//! FM and AV respectively.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::{Confidence, PayeeType};
use crate::errors::{Error, Result};

const STAGE: &str = "classify";
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_FACTOR: u32 = 2;
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ClassifyInput {
    pub name: String,
    pub address_context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassifyOutput {
    pub payee_type: PayeeType,
    pub confidence: Confidence,
    pub sic_code: Option<String>,
    pub reasoning: String,
}

impl ClassifyOutput {
    /// The provider-exhausted fallback: never fatal to the record.
    fn unknown(reason: &str) -> Self {
        Self { payee_type: PayeeType::Unknown, confidence: Confidence::ZERO, sic_code: None, reasoning: reason.to_string() }
    }
}

#[derive(Debug, Clone)]
pub struct AdjudicationInput {
    pub query_name: String,
    pub candidate_name: String,
    pub deterministic_score: f64,
}

#[derive(Debug, Clone)]
pub struct AdjudicationOutput {
    pub keep: bool,
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct AddressRepairInput {
    pub raw_address: String,
    pub vendor_verdict: String,
}

#[derive(Debug, Clone)]
pub struct AddressRepairOutput {
    pub corrected: Option<String>,
    pub reasoning: String,
}

/// Abstracts the classifier provider so tests can swap in a fake without a
/// live HTTP call — mirrors how BSC abstracts its HTTP client behind a trait.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, input: &ClassifyInput) -> anyhow::Result<ClassifyOutput>;
    async fn adjudicate_match(&self, input: &AdjudicationInput) -> anyhow::Result<AdjudicationOutput>;
    async fn repair_address(&self, input: &AddressRepairInput) -> anyhow::Result<AddressRepairOutput>;
}

pub struct HttpClassifier {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpClassifier {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self { http: reqwest::Client::new(), base_url, api_key }
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    name: &'a str,
    address_context: Option<&'a str>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    payee_type: String,
    confidence: f64,
    sic_code: Option<String>,
    reasoning: String,
}

#[derive(Serialize)]
struct AdjudicationRequest<'a> {
    query_name: &'a str,
    candidate_name: &'a str,
    deterministic_score: f64,
}

#[derive(Deserialize)]
struct AdjudicationResponse {
    keep: bool,
    rationale: String,
}

#[derive(Serialize)]
struct AddressRepairRequest<'a> {
    raw_address: &'a str,
    vendor_verdict: &'a str,
}

#[derive(Deserialize)]
struct AddressRepairResponse {
    corrected: Option<String>,
    reasoning: String,
}

fn parse_payee_type(s: &str) -> PayeeType {
    match s {
        "Individual" => PayeeType::Individual,
        "Business" => PayeeType::Business,
        "Government" => PayeeType::Government,
        "Insurance" => PayeeType::Insurance,
        "Banking" => PayeeType::Banking,
        "InternalTransfer" => PayeeType::InternalTransfer,
        _ => PayeeType::Unknown,
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    #[tracing::instrument(skip(self, input), fields(name = %input.name), err)]
    async fn classify(&self, input: &ClassifyInput) -> anyhow::Result<ClassifyOutput> {
        let resp: ClassifyResponse = self
            .http
            .post(format!("{}/classify", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ClassifyRequest { name: &input.name, address_context: input.address_context.as_deref() })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ClassifyOutput {
            payee_type: parse_payee_type(&resp.payee_type),
            confidence: Confidence::new(resp.confidence),
            sic_code: resp.sic_code,
            reasoning: resp.reasoning,
        })
    }

    async fn adjudicate_match(&self, input: &AdjudicationInput) -> anyhow::Result<AdjudicationOutput> {
        let resp: AdjudicationResponse = self
            .http
            .post(format!("{}/adjudicate", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&AdjudicationRequest {
                query_name: &input.query_name,
                candidate_name: &input.candidate_name,
                deterministic_score: input.deterministic_score,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(AdjudicationOutput { keep: resp.keep, rationale: resp.rationale })
    }

    async fn repair_address(&self, input: &AddressRepairInput) -> anyhow::Result<AddressRepairOutput> {
        let resp: AddressRepairResponse = self
            .http
            .post(format!("{}/repair-address", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&AddressRepairRequest { raw_address: &input.raw_address, vendor_verdict: &input.vendor_verdict })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(AddressRepairOutput { corrected: resp.corrected, reasoning: resp.reasoning })
    }
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let base_ms = RETRY_BASE.as_millis() as u64 * (RETRY_FACTOR as u64).pow(attempt);
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 4 + 1);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Retries a classifier call with exponential backoff + jitter (§4.3); a
/// final failure is captured as `payee_type=Unknown, confidence=0` rather
/// than propagated, since classify failures never fail the record.
pub async fn classify_with_retry(classifier: &dyn Classifier, input: &ClassifyInput) -> ClassifyOutput {
    let mut attempt = 0;
    loop {
        match classifier.classify(input).await {
            Ok(out) => return out,
            Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                tracing::warn!(attempt, error = %e, "classifier call failed, retrying");
                tokio::time::sleep(backoff_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "classifier exhausted retries");
                return ClassifyOutput::unknown(&format!("classifier unavailable: {e}"));
            }
        }
    }
}

/// Adjudication failures downgrade to the deterministic score rather than
/// failing the record (§4.2 "Failure semantics").
pub async fn adjudicate_with_fallback(classifier: &dyn Classifier, input: &AdjudicationInput) -> Option<AdjudicationOutput> {
    match classifier.adjudicate_match(input).await {
        Ok(out) => Some(out),
        Err(e) => {
            tracing::warn!(error = %e, "match adjudication failed, keeping deterministic score");
            None
        }
    }
}

/// Converts a transient/permanent classifier failure outside the retry loop
/// (e.g. rate-limiter `TryAgainLater`) into the error taxonomy, for stages
/// that need to distinguish rather than silently downgrade.
pub fn to_stage_error(err: anyhow::Error) -> Error {
    Error::StageTransient { stage: STAGE, message: err.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeClassifier {
        fail_times: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Classifier for FakeClassifier {
        async fn classify(&self, input: &ClassifyInput) -> anyhow::Result<ClassifyOutput> {
            if self.fail_times.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                anyhow::bail!("transient");
            }
            Ok(ClassifyOutput {
                payee_type: PayeeType::Business,
                confidence: Confidence::new(0.95),
                sic_code: Some("7389".to_string()),
                reasoning: format!("looks like a business: {}", input.name),
            })
        }
        async fn adjudicate_match(&self, _: &AdjudicationInput) -> anyhow::Result<AdjudicationOutput> {
            Ok(AdjudicationOutput { keep: true, rationale: "close enough".to_string() })
        }
        async fn repair_address(&self, _: &AddressRepairInput) -> anyhow::Result<AddressRepairOutput> {
            Ok(AddressRepairOutput { corrected: None, reasoning: "no repair needed".to_string() })
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let c = FakeClassifier { fail_times: std::sync::atomic::AtomicU32::new(2) };
        let out = classify_with_retry(&c, &ClassifyInput { name: "Acme Corp".to_string(), address_context: None }).await;
        assert_eq!(out.payee_type, PayeeType::Business);
    }

    #[tokio::test]
    async fn exhausts_to_unknown() {
        let c = FakeClassifier { fail_times: std::sync::atomic::AtomicU32::new(10) };
        let out = classify_with_retry(&c, &ClassifyInput { name: "Acme Corp".to_string(), address_context: None }).await;
        assert_eq!(out.payee_type, PayeeType::Unknown);
        assert_eq!(out.confidence.value(), 0.0);
    }
}
