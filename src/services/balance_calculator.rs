use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;
use std::sync::Arc;

use crate::{
    error::{AppError, Result},
    models::TransactionType,
    services::store::{keys, SharedStore},
};

/// Result of applying one transaction to a starting balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preview {
    Apply(BalancePreview),
    /// Debit would overdraw; nothing is applied.
    InsufficientFunds { start_display: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancePreview {
    pub start_minor: i64,
    pub start_display: Decimal,
    pub new_display: Decimal,
    pub new_minor: i64,
}

/// Converts between stored minor units and the display currency and applies
/// the transaction state machine. Pure; the rate is always passed in.
#[derive(Debug, Clone, Copy)]
pub struct BalanceCalculator {
    minor_units_per_coin: Decimal,
}

impl BalanceCalculator {
    pub fn new(minor_units_per_coin: i64) -> Self {
        Self {
            minor_units_per_coin: Decimal::from(minor_units_per_coin),
        }
    }

    pub fn to_display(&self, minor: i64, rate: Decimal) -> Result<Decimal> {
        Decimal::from(minor)
            .checked_mul(rate)
            .and_then(|v| v.checked_div(self.minor_units_per_coin))
            .ok_or_else(|| overflow("minor to display", minor))
    }

    pub fn to_minor(&self, display: Decimal, rate: Decimal) -> Result<i64> {
        if rate <= Decimal::ZERO {
            return Err(AppError::Internal(format!("Non-positive rate {}", rate)));
        }
        display
            .checked_mul(self.minor_units_per_coin)
            .and_then(|v| v.checked_div(rate))
            .map(|v| v.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
            .and_then(|v| v.to_i64())
            .ok_or_else(|| overflow("display to minor", display))
    }

    pub fn preview(
        &self,
        tx_type: TransactionType,
        amount: Decimal,
        start_minor: i64,
        rate: Decimal,
    ) -> Result<Preview> {
        let start_display = self.to_display(start_minor, rate)?;
        let signed = if tx_type.is_debit() { -amount } else { amount };
        let new_display = start_display
            .checked_add(signed)
            .ok_or_else(|| overflow("apply amount", start_display))?;

        if tx_type.is_debit() && new_display < Decimal::ZERO {
            return Ok(Preview::InsufficientFunds { start_display });
        }
        let new_display = new_display.max(Decimal::ZERO);

        let new_minor = if signed.is_zero() {
            start_minor
        } else {
            self.to_minor(new_display, rate)?.max(0)
        };

        Ok(Preview::Apply(BalancePreview {
            start_minor,
            start_display,
            new_display,
            new_minor,
        }))
    }
}

fn overflow(step: &str, value: impl std::fmt::Display) -> AppError {
    AppError::Internal(format!("Balance arithmetic overflow in {} ({})", step, value))
}

/// Two-decimal wire form, truncated so a balance is never overstated.
pub fn format_balance(display: Decimal) -> String {
    let truncated = display.round_dp_with_strategy(2, RoundingStrategy::ToZero);
    format!("{:.2}", truncated)
}

// ==================== PENDING BET ACCUMULATOR ====================

/// Running stake per `(username, gpid)` round, so a bare round cancellation
/// can refund everything staked in it.
///
/// Each bet is appended as an exact decimal string; sums are taken in
/// [`Decimal`] so no binary rounding creeps into a refund.
pub struct PendingBets {
    store: Arc<dyn SharedStore>,
    ttl_secs: u64,
}

/// Amount a transaction actually moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stake {
    pub amount: Decimal,
    /// Round whose accumulated stake was claimed to fund this refund.
    pub claimed_round: Option<String>,
}

impl PendingBets {
    pub fn new(store: Arc<dyn SharedStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    pub async fn accumulated(&self, username: &str, gpid: &str) -> Result<Decimal> {
        let items = self.store.list(&keys::pending_bet(username, gpid)).await?;
        sum_stakes(&items)
    }

    pub async fn record_bet(&self, username: &str, gpid: &str, amount: Decimal) -> Result<()> {
        self.store
            .push_ex(
                &keys::pending_bet(username, gpid),
                &amount.normalize().to_string(),
                self.ttl_secs,
            )
            .await
    }

    /// Removes and returns the round's stake. Concurrent callers never
    /// both see it.
    pub async fn take(&self, username: &str, gpid: &str) -> Result<Decimal> {
        let items = self
            .store
            .take_list(&keys::pending_bet(username, gpid))
            .await?;
        sum_stakes(&items)
    }

    /// Puts back a stake taken for a refund that never landed.
    pub async fn restore(&self, username: &str, gpid: &str, amount: Decimal) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.record_bet(username, gpid, amount).await
    }

    pub async fn clear(&self, username: &str, gpid: &str) -> Result<()> {
        self.store.del(&keys::pending_bet(username, gpid)).await
    }

    /// A zero-amount round cancellation claims the accumulated stake; the
    /// caller must [`restore`](Self::restore) it if the refund fails.
    pub async fn effective_amount(
        &self,
        tx_type: TransactionType,
        amount: Decimal,
        username: &str,
        gpid: Option<&str>,
    ) -> Result<Stake> {
        match (tx_type, gpid) {
            (TransactionType::CancelBet, Some(gpid)) if amount.is_zero() => Ok(Stake {
                amount: self.take(username, gpid).await?,
                claimed_round: Some(gpid.to_string()),
            }),
            _ => Ok(Stake {
                amount,
                claimed_round: None,
            }),
        }
    }

    /// Round bookkeeping after a committed transaction.
    pub async fn settle(
        &self,
        tx_type: TransactionType,
        amount: Decimal,
        username: &str,
        gpid: Option<&str>,
    ) -> Result<()> {
        let Some(gpid) = gpid else {
            return Ok(());
        };
        match tx_type {
            TransactionType::Bet => self.record_bet(username, gpid, amount).await,
            TransactionType::Win | TransactionType::CancelBet => self.clear(username, gpid).await,
            TransactionType::CancelWin => Ok(()),
        }
    }
}

fn sum_stakes(items: &[String]) -> Result<Decimal> {
    items.iter().try_fold(Decimal::ZERO, |total, raw| {
        let stake = Decimal::from_str(raw.trim())
            .map_err(|e| AppError::Internal(format!("Corrupt pending stake '{}': {}", raw, e)))?;
        total
            .checked_add(stake)
            .ok_or_else(|| AppError::Internal("Pending stake overflow".to_string()))
    })
}
