use crate::{
    error::RemoteError,
    remote::{
        ClaimReceipt,
        RequestStatus,
    },
};
use std::{
    collections::HashMap,
    fmt,
};
use tracing::{
    info,
    warn,
};

/// Share of total sale kept as commission in the account summary.
pub const COMMISSION_RATE: f64 = 0.03;

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryRecord {
    pub ticket_serial: String,
    pub card_type: Option<String>,
    pub result_number: Option<i64>,
    pub bet_amount: f64,
    pub claim_point: Option<f64>,
    pub unclaim_point: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TicketStatus {
    Pending,
    Lost,
    Won,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TicketStatus::Pending => "Pending",
            TicketStatus::Lost => "Lost",
            TicketStatus::Won => "Won",
        };
        f.write_str(s)
    }
}

impl HistoryRecord {
    pub fn status(&self) -> TicketStatus {
        let positive = |v: Option<f64>| v.is_some_and(|p| p > 0.0);
        if positive(self.claim_point) || positive(self.unclaim_point) {
            TicketStatus::Won
        } else if self.claim_point.is_none() && self.unclaim_point.is_none() {
            TicketStatus::Pending
        } else {
            TicketStatus::Lost
        }
    }

    /// A win that has not been collected yet.
    pub fn is_claimable(&self) -> bool {
        self.claim_point == Some(0.0) && self.unclaim_point.is_some_and(|p| p > 0.0)
    }
}

/// Latest history as reported by the dashboard. Replaced wholesale on refresh.
#[derive(Clone, Debug, Default)]
pub struct HistoryCache {
    records: Vec<HistoryRecord>,
    refreshed_at: Option<f64>,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, records: Vec<HistoryRecord>, refreshed_at: f64) {
        self.records = records;
        self.refreshed_at = Some(refreshed_at);
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn refreshed_at(&self) -> Option<f64> {
        self.refreshed_at
    }

    pub fn find(&self, ticket_serial: &str) -> Option<&HistoryRecord> {
        self.records.iter().find(|r| r.ticket_serial == ticket_serial)
    }
}

/// Tracks claim requests per ticket. The remote ledger is the only source of
/// truth for claim state; entries here only gate the local action.
#[derive(Clone, Debug, Default)]
pub struct ClaimService {
    claims: HashMap<String, RequestStatus>,
}

impl ClaimService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, ticket_serial: &str) -> RequestStatus {
        self.claims
            .get(ticket_serial)
            .cloned()
            .unwrap_or_default()
    }

    /// A ticket can be claimed when the record says so and no request for it
    /// has been sent since the last refresh.
    pub fn can_claim(&self, cache: &HistoryCache, ticket_serial: &str) -> bool {
        cache.find(ticket_serial).is_some_and(HistoryRecord::is_claimable)
            && !self.claims.contains_key(ticket_serial)
    }

    /// Marks the claim as in flight. Returns `false` (no request should be
    /// sent) if the ticket is not claimable or a request is already out.
    pub fn begin_claim(&mut self, cache: &HistoryCache, ticket_serial: &str) -> bool {
        if !self.can_claim(cache, ticket_serial) {
            return false;
        }
        self.claims
            .insert(ticket_serial.to_string(), RequestStatus::Pending);
        true
    }

    pub fn complete_claim(
        &mut self,
        ticket_serial: &str,
        result: Result<ClaimReceipt, RemoteError>,
    ) {
        let status = match result {
            Ok(receipt) => {
                info!(
                    ticket = ticket_serial,
                    claim_point = ?receipt.claim_point,
                    "claim accepted"
                );
                RequestStatus::Submitted {
                    reference: receipt.ticket_serial,
                }
            }
            Err(err) => {
                warn!(ticket = ticket_serial, %err, "claim failed");
                RequestStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };
        self.claims.insert(ticket_serial.to_string(), status);
    }

    /// Drops finished claims once fresh records arrive; requests still in
    /// flight stay blocked.
    pub fn on_refresh(&mut self) {
        self.claims.retain(|_, status| status.is_pending());
    }

    pub fn statuses(&self) -> impl Iterator<Item = (&str, &RequestStatus)> {
        self.claims.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AccountSummary {
    pub total_sale: f64,
    pub total_win: f64,
    pub total_commission: f64,
    pub net_point: f64,
}

impl AccountSummary {
    pub fn from_records(records: &[HistoryRecord]) -> Self {
        let total_sale: f64 = records.iter().map(|r| r.bet_amount).sum();
        let total_win: f64 = records.iter().filter_map(|r| r.claim_point).sum();
        let total_commission = total_sale * COMMISSION_RATE;
        let net_point = total_sale - total_win - total_commission;
        Self {
            total_sale: round2(total_sale),
            total_win: round2(total_win),
            total_commission: round2(total_commission),
            net_point: round2(net_point),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    fn record(serial: &str, claim: Option<f64>, unclaim: Option<f64>) -> HistoryRecord {
        HistoryRecord {
            ticket_serial: serial.to_string(),
            card_type: None,
            result_number: None,
            bet_amount: 10.0,
            claim_point: claim,
            unclaim_point: unclaim,
        }
    }

    fn cache_with(records: Vec<HistoryRecord>) -> HistoryCache {
        let mut cache = HistoryCache::new();
        cache.replace(records, 100.0);
        cache
    }

    #[test]
    fn status__derives_pending_lost_won() {
        let pending = record("a", None, None);
        let lost = record("b", Some(0.0), Some(0.0));
        let won = record("c", Some(0.0), Some(25.0));

        assert_eq!(pending.status(), TicketStatus::Pending);
        assert_eq!(lost.status(), TicketStatus::Lost);
        assert_eq!(won.status(), TicketStatus::Won);
        assert!(won.is_claimable());
        assert!(!lost.is_claimable());
        assert!(!pending.is_claimable());
    }

    #[test]
    fn is_claimable__false_once_collected() {
        let collected = record("d", Some(25.0), Some(0.0));
        assert_eq!(collected.status(), TicketStatus::Won);
        assert!(!collected.is_claimable());
    }

    #[test]
    fn begin_claim__is_noop_for_unclaimable_ticket() {
        let cache = cache_with(vec![record("lost", Some(0.0), Some(0.0))]);
        let mut claims = ClaimService::new();
        assert!(!claims.begin_claim(&cache, "lost"));
        assert!(!claims.begin_claim(&cache, "unknown"));
        assert_eq!(claims.status("lost"), RequestStatus::Idle);
    }

    #[test]
    fn begin_claim__blocks_second_request_until_refresh() {
        // given
        let cache = cache_with(vec![record("win", Some(0.0), Some(40.0))]);
        let mut claims = ClaimService::new();
        assert!(claims.begin_claim(&cache, "win"));

        // when
        let second = claims.begin_claim(&cache, "win");

        // then
        assert!(!second);
        assert_eq!(claims.status("win"), RequestStatus::Pending);
    }

    #[test]
    fn on_refresh__reenables_failed_claim_if_still_claimable() {
        // given
        let cache = cache_with(vec![record("win", Some(0.0), Some(40.0))]);
        let mut claims = ClaimService::new();
        claims.begin_claim(&cache, "win");
        claims.complete_claim("win", Err(RemoteError::Transient("reset".into())));
        assert!(!claims.can_claim(&cache, "win"));

        // when
        claims.on_refresh();

        // then
        assert!(claims.can_claim(&cache, "win"));
    }

    #[test]
    fn on_refresh__keeps_in_flight_claims_blocked() {
        let cache = cache_with(vec![record("win", Some(0.0), Some(40.0))]);
        let mut claims = ClaimService::new();
        claims.begin_claim(&cache, "win");
        claims.on_refresh();
        assert!(!claims.can_claim(&cache, "win"));
    }

    #[test]
    fn account_summary__rounds_to_two_places() {
        // given
        let mut a = record("a", Some(0.0), Some(50.0));
        a.bet_amount = 33.33;
        let mut b = record("b", Some(20.0), Some(0.0));
        b.bet_amount = 66.67;
        let c = record("c", None, None);

        // when
        let summary = AccountSummary::from_records(&[a, b, c]);

        // then
        assert_eq!(summary.total_sale, 110.0);
        assert_eq!(summary.total_win, 20.0);
        assert_eq!(summary.total_commission, 3.3);
        assert_eq!(summary.net_point, 86.7);
    }
}
