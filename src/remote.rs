use crate::{
    error::RemoteError,
    history::HistoryRecord,
    ledger::WagerBatch,
    outcome::{
        Outcome,
        SEGMENT_COUNT,
    },
};
use reqwest::StatusCode;
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    de::DeserializeOwned,
};
use std::{
    future::Future,
    time::Duration,
};
use tracing::{
    debug,
    warn,
};

pub const DEFAULT_API_URL: &str = "https://spintofortune.in/api";
pub const DASHBOARD_ENDPOINT: &str = "app_dashboard_data.php";
pub const OUTCOME_ENDPOINT: &str = "app_outcome.php";
pub const WAGER_ENDPOINT: &str = "app_place_wager.php";
pub const CLAIM_ENDPOINT: &str = "app_claim.php";

/// Non-blocking status of an outbound wager or claim request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RequestStatus {
    #[default]
    Idle,
    Pending,
    Submitted { reference: Option<String> },
    /// The request failed and will not be retried automatically.
    Failed { reason: String },
}

impl RequestStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestStatus::Pending)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserProfile {
    pub points: f64,
    pub winning_points: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DashboardData {
    pub server_timestamp: f64,
    pub last_spin_timestamp: Option<f64>,
    pub records: Vec<HistoryRecord>,
    pub profile: Option<UserProfile>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WagerReceipt {
    pub ticket_serial: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClaimReceipt {
    pub ticket_serial: Option<String>,
    pub claim_point: Option<f64>,
    pub message: Option<String>,
}

/// The remote ledger of record. Every call is a single request; retries are
/// the caller's decision.
pub trait RemoteLedger: Send + Sync + 'static {
    fn dashboard(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<DashboardData, RemoteError>> + Send;

    fn outcome(
        &self,
        cycle_label: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Outcome, RemoteError>> + Send;

    fn submit_wagers(
        &self,
        batch: &WagerBatch,
    ) -> impl Future<Output = Result<WagerReceipt, RemoteError>> + Send;

    fn claim(
        &self,
        ticket_serial: &str,
    ) -> impl Future<Output = Result<ClaimReceipt, RemoteError>> + Send;
}

#[derive(Clone, Debug)]
pub struct HttpLedger {
    base_url: String,
    http: reqwest::Client,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<B, R>(&self, endpoint: &str, body: &B) -> Result<R, RemoteError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, endpoint);
        let res = self.http.post(&url).json(body).send().await?;
        let status = res.status();
        let bytes = res.bytes().await?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(endpoint, bytes = bytes.len(), "remote response received");
        serde_json::from_slice(&bytes)
            .map_err(|err| RemoteError::Malformed(format!("{endpoint}: {err}")))
    }
}

impl RemoteLedger for HttpLedger {
    async fn dashboard(&self, user_id: &str) -> Result<DashboardData, RemoteError> {
        let dto: DashboardDto = self
            .post_json(DASHBOARD_ENDPOINT, &DashboardRequest { user_id })
            .await?;
        dto.try_into()
    }

    async fn outcome(&self, cycle_label: &str, user_id: &str) -> Result<Outcome, RemoteError> {
        let dto: OutcomeDto = self
            .post_json(
                OUTCOME_ENDPOINT,
                &OutcomeRequest {
                    cycle_label,
                    user_id,
                },
            )
            .await?;
        dto.try_into()
    }

    async fn submit_wagers(&self, batch: &WagerBatch) -> Result<WagerReceipt, RemoteError> {
        let dto: AckDto = self
            .post_json(WAGER_ENDPOINT, &WagerRequest::from(batch))
            .await?;
        let (ticket_serial, message, _) = dto.into_accepted(WAGER_ENDPOINT)?;
        Ok(WagerReceipt {
            ticket_serial,
            message,
        })
    }

    async fn claim(&self, ticket_serial: &str) -> Result<ClaimReceipt, RemoteError> {
        let dto: AckDto = self
            .post_json(CLAIM_ENDPOINT, &ClaimRequest { ticket_serial })
            .await?;
        let (serial, message, claim_point) = dto.into_accepted(CLAIM_ENDPOINT)?;
        Ok(ClaimReceipt {
            ticket_serial: serial.or_else(|| Some(ticket_serial.to_string())),
            claim_point,
            message,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardRequest<'a> {
    user_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutcomeRequest<'a> {
    cycle_label: &'a str,
    user_id: &'a str,
}

#[derive(Serialize)]
struct CellAmountDto {
    rank: u8,
    suit: u8,
    amount: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WagerRequest<'a> {
    cell_amounts: Vec<CellAmountDto>,
    cycle_label: &'a str,
    user_id: &'a str,
}

impl<'a> From<&'a WagerBatch> for WagerRequest<'a> {
    fn from(batch: &'a WagerBatch) -> Self {
        Self {
            cell_amounts: batch
                .cell_amounts
                .iter()
                .map(|(cell, amount)| CellAmountDto {
                    rank: cell.rank(),
                    suit: cell.suit(),
                    amount: *amount,
                })
                .collect(),
            cycle_label: &batch.cycle_label,
            user_id: &batch.user_id,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest<'a> {
    ticket_serial: &'a str,
}

// The dashboard backend is loose about types: numbers often arrive as
// strings and flags as "success"/1/true.
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl Loose {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Loose::Number(n) => n.as_f64(),
            Loose::Text(s) => s.trim().parse::<f64>().ok(),
            Loose::Bool(_) => None,
        }
        .filter(|v| v.is_finite())
    }

    fn into_text(self) -> Option<String> {
        match self {
            Loose::Text(s) if s.trim().is_empty() => None,
            Loose::Text(s) => Some(s),
            Loose::Number(n) => Some(n.to_string()),
            Loose::Bool(_) => None,
        }
    }

    fn as_flag(&self) -> Option<bool> {
        match self {
            Loose::Bool(b) => Some(*b),
            Loose::Number(n) => n.as_f64().map(|v| v != 0.0),
            Loose::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "success" | "ok" | "1" => Some(true),
                "false" | "error" | "fail" | "failed" | "0" => Some(false),
                _ => None,
            },
        }
    }
}

fn loose_f64<'de, D>(de: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Loose>::deserialize(de)?.and_then(|v| v.as_f64()))
}

fn loose_text<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Loose>::deserialize(de)?.and_then(Loose::into_text))
}

fn loose_flag<'de, D>(de: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Loose>::deserialize(de)?.and_then(|v| v.as_flag()))
}

#[derive(Deserialize)]
struct HistoryRecordDto {
    #[serde(default, alias = "ticketSerial", deserialize_with = "loose_text")]
    ticket_serial: Option<String>,
    #[serde(default, alias = "cardType", deserialize_with = "loose_text")]
    card_type: Option<String>,
    #[serde(default, alias = "resultNumber", deserialize_with = "loose_f64")]
    result_number: Option<f64>,
    #[serde(default, alias = "betAmount", deserialize_with = "loose_f64")]
    bet_amount: Option<f64>,
    #[serde(default, alias = "claimPoint", deserialize_with = "loose_f64")]
    claim_point: Option<f64>,
    #[serde(default, alias = "unclaimPoint", deserialize_with = "loose_f64")]
    unclaim_point: Option<f64>,
}

impl HistoryRecordDto {
    fn into_record(self) -> Option<HistoryRecord> {
        let ticket_serial = self.ticket_serial?;
        Some(HistoryRecord {
            ticket_serial,
            card_type: self.card_type,
            result_number: self.result_number.map(|n| n as i64),
            bet_amount: self.bet_amount.unwrap_or(0.0),
            claim_point: self.claim_point,
            unclaim_point: self.unclaim_point,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardDto {
    #[serde(default, alias = "server_timestamp", deserialize_with = "loose_f64")]
    server_timestamp: Option<f64>,
    #[serde(default, alias = "last_spin_timestamp", deserialize_with = "loose_f64")]
    last_spin_timestamp: Option<f64>,
    #[serde(default)]
    mapped: Vec<HistoryRecordDto>,
    #[serde(default, deserialize_with = "loose_f64")]
    points: Option<f64>,
    #[serde(default, alias = "winning_points", deserialize_with = "loose_f64")]
    winning_points: Option<f64>,
}

impl TryFrom<DashboardDto> for DashboardData {
    type Error = RemoteError;

    fn try_from(dto: DashboardDto) -> Result<Self, Self::Error> {
        let server_timestamp = dto
            .server_timestamp
            .ok_or_else(|| RemoteError::missing_field(DASHBOARD_ENDPOINT, "serverTimestamp"))?;
        let total = dto.mapped.len();
        let records: Vec<HistoryRecord> = dto
            .mapped
            .into_iter()
            .filter_map(HistoryRecordDto::into_record)
            .collect();
        if records.len() < total {
            warn!(
                dropped = total - records.len(),
                "history records without a ticket serial were skipped"
            );
        }
        let profile = dto.points.map(|points| UserProfile {
            points,
            winning_points: dto.winning_points,
        });
        Ok(DashboardData {
            server_timestamp,
            last_spin_timestamp: dto.last_spin_timestamp,
            records,
            profile,
        })
    }
}

#[derive(Deserialize)]
struct OutcomeDto {
    #[serde(default, rename = "chosenIndex", alias = "chosen_index", deserialize_with = "loose_f64")]
    chosen_index: Option<f64>,
    #[serde(
        default,
        rename = "chosenIndexPoint",
        alias = "chosen_index_point",
        deserialize_with = "loose_f64"
    )]
    chosen_index_point: Option<f64>,
}

impl TryFrom<OutcomeDto> for Outcome {
    type Error = RemoteError;

    fn try_from(dto: OutcomeDto) -> Result<Self, Self::Error> {
        let index = dto
            .chosen_index
            .ok_or_else(|| RemoteError::missing_field(OUTCOME_ENDPOINT, "chosenIndex"))?;
        let payout_multiplier = dto
            .chosen_index_point
            .ok_or_else(|| RemoteError::missing_field(OUTCOME_ENDPOINT, "chosenIndexPoint"))?;
        if index < 0.0 || index.fract() != 0.0 || index >= SEGMENT_COUNT as f64 {
            return Err(RemoteError::Malformed(format!(
                "{OUTCOME_ENDPOINT}: chosenIndex {index} is not a segment index"
            )));
        }
        Ok(Outcome {
            target_segment_index: index as usize,
            payout_multiplier,
        })
    }
}

/// Shared acknowledgement shape of the wager and claim endpoints.
#[derive(Deserialize)]
struct AckDto {
    #[serde(default, alias = "status", deserialize_with = "loose_flag")]
    success: Option<bool>,
    #[serde(default, alias = "msg", deserialize_with = "loose_text")]
    message: Option<String>,
    #[serde(default, alias = "ticketSerial", deserialize_with = "loose_text")]
    ticket_serial: Option<String>,
    #[serde(default, alias = "claimPoint", deserialize_with = "loose_f64")]
    claim_point: Option<f64>,
}

impl AckDto {
    fn into_accepted(
        self,
        endpoint: &str,
    ) -> Result<(Option<String>, Option<String>, Option<f64>), RemoteError> {
        match self.success {
            Some(true) => Ok((self.ticket_serial, self.message, self.claim_point)),
            Some(false) => Err(RemoteError::Rejected {
                status: StatusCode::OK.as_u16(),
                body: self.message.unwrap_or_else(|| "request refused".to_string()),
            }),
            None => Err(RemoteError::missing_field(endpoint, "success")),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::ledger::WagerCell;
    use std::collections::BTreeMap;

    fn dashboard(json: &str) -> Result<DashboardData, RemoteError> {
        let dto: DashboardDto = serde_json::from_str(json).unwrap();
        dto.try_into()
    }

    fn outcome(json: &str) -> Result<Outcome, RemoteError> {
        let dto: OutcomeDto = serde_json::from_str(json).unwrap();
        dto.try_into()
    }

    #[test]
    fn dashboard__accepts_numbers_sent_as_strings() {
        // given
        let json = r#"{
            "serverTimestamp": "1700000100.5",
            "lastSpinTimestamp": 1700000040,
            "points": "950",
            "winning_points": 25,
            "mapped": [
                {"ticket_serial": "A1", "card_type": "K of Spades", "bet_amount": "10",
                 "claim_point": "0", "unclaim_point": "25", "result_number": "3"},
                {"ticket_serial": 77, "bet_amount": 5, "claim_point": null, "unclaim_point": null}
            ]
        }"#;

        // when
        let data = dashboard(json).unwrap();

        // then
        assert_eq!(data.server_timestamp, 1_700_000_100.5);
        assert_eq!(data.last_spin_timestamp, Some(1_700_000_040.0));
        assert_eq!(data.records.len(), 2);
        assert_eq!(data.records[0].unclaim_point, Some(25.0));
        assert_eq!(data.records[0].result_number, Some(3));
        assert_eq!(data.records[1].ticket_serial, "77");
        assert_eq!(data.records[1].claim_point, None);
        assert_eq!(
            data.profile,
            Some(UserProfile {
                points: 950.0,
                winning_points: Some(25.0)
            })
        );
    }

    #[test]
    fn dashboard__missing_server_timestamp_is_malformed() {
        let res = dashboard(r#"{"mapped": []}"#);
        assert!(matches!(res, Err(RemoteError::Malformed(_))));
    }

    #[test]
    fn dashboard__skips_records_without_serial() {
        let data =
            dashboard(r#"{"serverTimestamp": 5, "mapped": [{"bet_amount": 5}]}"#).unwrap();
        assert!(data.records.is_empty());
        assert_eq!(data.profile, None);
    }

    #[test]
    fn outcome__parses_index_and_multiplier() {
        let o = outcome(r#"{"chosenIndex": "7", "chosenIndexPoint": 10}"#).unwrap();
        assert_eq!(
            o,
            Outcome {
                target_segment_index: 7,
                payout_multiplier: 10.0
            }
        );
    }

    #[test]
    fn outcome__rejects_missing_or_out_of_range_index() {
        assert!(matches!(
            outcome(r#"{"chosenIndexPoint": 2}"#),
            Err(RemoteError::Malformed(_))
        ));
        assert!(matches!(
            outcome(r#"{"chosenIndex": 12, "chosenIndexPoint": 2}"#),
            Err(RemoteError::Malformed(_))
        ));
        assert!(matches!(
            outcome(r#"{"chosenIndex": -1, "chosenIndexPoint": 2}"#),
            Err(RemoteError::Malformed(_))
        ));
    }

    #[test]
    fn ack__explicit_refusal_is_rejected() {
        let dto: AckDto =
            serde_json::from_str(r#"{"status": "error", "message": "cycle closed"}"#).unwrap();
        match dto.into_accepted(WAGER_ENDPOINT) {
            Err(RemoteError::Rejected { status, body }) => {
                assert_eq!(status, 200);
                assert_eq!(body, "cycle closed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ack__success_carries_ticket_serial() {
        let dto: AckDto =
            serde_json::from_str(r#"{"success": true, "ticketSerial": 9001}"#).unwrap();
        let (serial, _, _) = dto.into_accepted(WAGER_ENDPOINT).unwrap();
        assert_eq!(serial.as_deref(), Some("9001"));
    }

    #[test]
    fn wager_request__serializes_camel_case_cells() {
        // given
        let mut cell_amounts = BTreeMap::new();
        cell_amounts.insert(WagerCell::new(1, 2).unwrap(), 50);
        let batch = WagerBatch {
            cell_amounts,
            cycle_label: "12:02:00".to_string(),
            user_id: "7".to_string(),
        };

        // when
        let json = serde_json::to_value(WagerRequest::from(&batch)).unwrap();

        // then
        assert_eq!(
            json,
            serde_json::json!({
                "cellAmounts": [{"rank": 1, "suit": 2, "amount": 50}],
                "cycleLabel": "12:02:00",
                "userId": "7"
            })
        );
    }
}
