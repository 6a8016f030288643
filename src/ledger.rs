use crate::{
    error::{
        LedgerError,
        RemoteError,
    },
    remote::{
        RequestStatus,
        WagerReceipt,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::BTreeMap,
    fmt,
};
use tracing::{
    info,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChipDefinition {
    pub denomination: u64,
    pub display_tag: &'static str,
}

pub const CHIP_CATALOG: [ChipDefinition; 7] = [
    ChipDefinition {
        denomination: 5,
        display_tag: "White",
    },
    ChipDefinition {
        denomination: 10,
        display_tag: "Red",
    },
    ChipDefinition {
        denomination: 20,
        display_tag: "Blue",
    },
    ChipDefinition {
        denomination: 50,
        display_tag: "Green",
    },
    ChipDefinition {
        denomination: 100,
        display_tag: "Black",
    },
    ChipDefinition {
        denomination: 200,
        display_tag: "Purple",
    },
    ChipDefinition {
        denomination: 500,
        display_tag: "Orange",
    },
];

pub fn chip(denomination: u64) -> Option<&'static ChipDefinition> {
    CHIP_CATALOG.iter().find(|c| c.denomination == denomination)
}

pub const RANK_LABELS: [&str; 3] = ["K", "Q", "J"];
pub const SUIT_LABELS: [&str; 4] = ["Spades", "Diamonds", "Clubs", "Hearts"];

/// One of the twelve rank × suit cells on the wager table.
/// `rank` is 1..=3 (K, Q, J), `suit` is 1..=4 (Spades, Diamonds, Clubs, Hearts).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WagerCell {
    rank: u8,
    suit: u8,
}

impl WagerCell {
    pub fn new(rank: u8, suit: u8) -> Option<Self> {
        ((1..=3).contains(&rank) && (1..=4).contains(&suit)).then_some(Self { rank, suit })
    }

    pub(crate) fn from_parts(rank: u8, suit: u8) -> Self {
        debug_assert!((1..=3).contains(&rank) && (1..=4).contains(&suit));
        Self { rank, suit }
    }

    pub fn rank(&self) -> u8 {
        self.rank
    }

    pub fn suit(&self) -> u8 {
        self.suit
    }

    pub fn rank_label(&self) -> &'static str {
        RANK_LABELS[usize::from(self.rank - 1)]
    }

    pub fn suit_label(&self) -> &'static str {
        SUIT_LABELS[usize::from(self.suit - 1)]
    }

    /// All cells in table order: rows K, Q, J; columns by suit.
    pub fn all() -> impl Iterator<Item = WagerCell> {
        (1..=3u8).flat_map(|rank| (1..=4u8).map(move |suit| WagerCell { rank, suit }))
    }
}

impl fmt::Display for WagerCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.rank_label(), self.suit_label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WagerBatch {
    pub cell_amounts: BTreeMap<WagerCell, u64>,
    pub cycle_label: String,
    pub user_id: String,
}

impl WagerBatch {
    pub fn total(&self) -> u64 {
        self.cell_amounts.values().fold(0, |acc, a| acc.saturating_add(*a))
    }
}

/// What the renderer needs to draw the wager table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub selection: Option<u64>,
    pub placed: Vec<(WagerCell, u64)>,
    pub total: u64,
    pub balance: Option<u64>,
    pub status: RequestStatus,
    pub can_repeat: bool,
}

#[derive(Debug, Default)]
pub struct WagerLedger {
    selection: Option<u64>,
    placed: BTreeMap<WagerCell, u64>,
    last_submitted: Option<WagerBatch>,
    in_flight: Option<WagerBatch>,
    balance: Option<u64>,
    status: RequestStatus,
}

impl WagerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_chip(&mut self, denomination: u64) -> Result<(), LedgerError> {
        if chip(denomination).is_none() {
            return Err(LedgerError::UnknownDenomination(denomination));
        }
        self.selection = Some(denomination);
        Ok(())
    }

    pub fn selection(&self) -> Option<u64> {
        self.selection
    }

    pub fn place_on(&mut self, cell: WagerCell) -> Result<u64, LedgerError> {
        let amount = self.selection.ok_or(LedgerError::NoChipSelected)?;
        self.check_affordable(self.total().saturating_add(amount))?;
        let entry = self.placed.entry(cell).or_insert(0);
        *entry = entry.saturating_add(amount);
        Ok(*entry)
    }

    pub fn clear(&mut self) {
        self.placed.clear();
    }

    pub fn double(&mut self) -> Result<(), LedgerError> {
        self.check_affordable(self.total().saturating_mul(2))?;
        for amount in self.placed.values_mut() {
            *amount = amount.saturating_mul(2);
        }
        Ok(())
    }

    /// Restores the last submitted batch; no-op if nothing was ever submitted.
    pub fn repeat(&mut self) -> Result<(), LedgerError> {
        let Some(last) = &self.last_submitted else {
            return Ok(());
        };
        self.check_affordable(last.total())?;
        self.placed = last.cell_amounts.clone();
        Ok(())
    }

    pub fn placed(&self) -> &BTreeMap<WagerCell, u64> {
        &self.placed
    }

    pub fn amount_on(&self, cell: WagerCell) -> u64 {
        self.placed.get(&cell).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.placed.values().fold(0, |acc, a| acc.saturating_add(*a))
    }

    pub fn balance(&self) -> Option<u64> {
        self.balance
    }

    pub fn set_balance(&mut self, balance: Option<u64>) {
        self.balance = balance;
    }

    pub fn last_submitted(&self) -> Option<&WagerBatch> {
        self.last_submitted.as_ref()
    }

    pub fn status(&self) -> &RequestStatus {
        &self.status
    }

    /// Moves the placed wagers into an in-flight batch. The table is free for
    /// the next batch while the request is outstanding.
    pub fn begin_submit(
        &mut self,
        cycle_label: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<WagerBatch, LedgerError> {
        if self.in_flight.is_some() {
            return Err(LedgerError::SubmissionInFlight);
        }
        if self.placed.values().all(|a| *a == 0) {
            return Err(LedgerError::EmptyBatch);
        }
        let mut cell_amounts = std::mem::take(&mut self.placed);
        cell_amounts.retain(|_, a| *a > 0);
        let batch = WagerBatch {
            cell_amounts,
            cycle_label: cycle_label.into(),
            user_id: user_id.into(),
        };
        self.in_flight = Some(batch.clone());
        self.status = RequestStatus::Pending;
        Ok(batch)
    }

    /// Applies the remote verdict. The balance is debited only on success; a
    /// failed batch goes back onto the table.
    pub fn complete_submit(&mut self, result: Result<WagerReceipt, RemoteError>) {
        let Some(batch) = self.in_flight.take() else {
            warn!("submission result arrived with no batch in flight");
            return;
        };
        match result {
            Ok(receipt) => {
                let total = batch.total();
                self.balance = self.balance.map(|b| b.saturating_sub(total));
                info!(
                    cycle = %batch.cycle_label,
                    total,
                    ticket = ?receipt.ticket_serial,
                    "wager batch accepted"
                );
                self.last_submitted = Some(batch);
                self.status = RequestStatus::Submitted {
                    reference: receipt.ticket_serial,
                };
            }
            Err(err) => {
                warn!(cycle = %batch.cycle_label, %err, "wager batch failed; restoring table");
                for (cell, amount) in batch.cell_amounts {
                    let entry = self.placed.entry(cell).or_insert(0);
                    *entry = entry.saturating_add(amount);
                }
                self.status = RequestStatus::Failed {
                    reason: err.to_string(),
                };
            }
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            selection: self.selection,
            placed: self.placed.iter().map(|(c, a)| (*c, *a)).collect(),
            total: self.total(),
            balance: self.balance,
            status: self.status.clone(),
            can_repeat: self.last_submitted.is_some(),
        }
    }

    // `on_table` is what the table would hold; an in-flight batch is not
    // debited yet but is already spoken for.
    fn check_affordable(&self, on_table: u64) -> Result<(), LedgerError> {
        let committed = self.in_flight.as_ref().map_or(0, WagerBatch::total);
        let required = on_table.saturating_add(committed);
        match self.balance {
            Some(available) if required > available => {
                Err(LedgerError::InsufficientBalance {
                    required,
                    available,
                })
            }
            _ => Ok(()),
        }
    }
}
