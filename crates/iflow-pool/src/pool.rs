//! Account pool and selection strategies
//!
//! The pool owns the ordered account list and a cursor into it. Health and
//! rate-limit state live on each `Account` and heal lazily: an unhealthy
//! account whose recovery time has passed is cleared the next time a
//! selection considers it. There is no background timer.
//!
//! Every method takes the lock once and is atomic within its own call.
//! Dispatch flows that interleave between calls may overwrite each other's
//! changes; the snapshot on disk is last-writer-wins.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use iflow_auth::{Account, AccountStorage, AuthMethod, Persistence, STORAGE_VERSION};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::lifecycle::CredentialUpdate;

/// How `select_account` picks among available accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Keep using the account at the cursor while it stays available.
    Sticky,
    /// Rotate through available accounts on every call.
    #[default]
    RoundRobin,
}

impl SelectionStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            SelectionStrategy::Sticky => "sticky",
            SelectionStrategy::RoundRobin => "round-robin",
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sticky" => Ok(SelectionStrategy::Sticky),
            "round-robin" => Ok(SelectionStrategy::RoundRobin),
            other => Err(format!("unknown selection strategy: {other}")),
        }
    }
}

struct PoolState {
    accounts: Vec<Account>,
    cursor: usize,
}

/// In-memory account pool backed by a `Persistence` store.
pub struct Pool {
    state: RwLock<PoolState>,
    strategy: SelectionStrategy,
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
}

impl Pool {
    pub fn new(
        accounts: Vec<Account>,
        strategy: SelectionStrategy,
        store: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            accounts = accounts.len(),
            strategy = strategy.label(),
            "pool initialized"
        );
        Self {
            state: RwLock::new(PoolState {
                accounts,
                cursor: 0,
            }),
            strategy,
            store,
            clock,
        }
    }

    /// Build a pool from the stored snapshot. `activeIndex` becomes the
    /// cursor, clamped into range.
    pub async fn load(
        store: Arc<dyn Persistence>,
        strategy: SelectionStrategy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let storage = store.load().await?;
        let cursor = if storage.accounts.is_empty() {
            0
        } else {
            storage.active_index.min(storage.accounts.len() - 1)
        };
        let pool = Self::new(storage.accounts, strategy, store, clock);
        pool.state.write().await.cursor = cursor;
        Ok(pool)
    }

    /// Write the current accounts and cursor through the store.
    pub async fn save(&self) -> Result<()> {
        let storage = {
            let state = self.state.read().await;
            AccountStorage {
                version: STORAGE_VERSION,
                accounts: state.accounts.clone(),
                active_index: state.cursor,
            }
        };
        self.store.save(&storage).await.map_err(|e| {
            warn!(error = %e, "failed to persist account pool");
            Error::Persistence(e.to_string())
        })
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.accounts.is_empty()
    }

    /// Copy of every account in pool order.
    pub async fn list(&self) -> Vec<Account> {
        self.state.read().await.accounts.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Account> {
        self.state
            .read()
            .await
            .accounts
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub async fn cursor(&self) -> usize {
        self.state.read().await.cursor
    }

    /// Pick an available account per the strategy and stamp its `last_used`.
    ///
    /// Unhealthy accounts whose recovery time has passed are cleared here as
    /// a side effect, then still subject to the rate-limit check. Returns
    /// `None` when nothing is available; callers then consult
    /// `min_wait_time`.
    pub async fn select_account(&self) -> Option<Account> {
        let now = self.clock.now_millis();
        let mut state = self.state.write().await;
        let n = state.accounts.len();
        if n == 0 {
            return None;
        }

        let available: Vec<bool> = state
            .accounts
            .iter_mut()
            .map(|account| check_available(account, now))
            .collect();

        let cursor = state.cursor % n;
        let selected = match self.strategy {
            SelectionStrategy::Sticky => {
                if available[cursor] {
                    Some(cursor)
                } else {
                    available.iter().position(|a| *a)
                }
            }
            SelectionStrategy::RoundRobin => (0..n)
                .map(|offset| (cursor + offset) % n)
                .find(|&idx| available[idx]),
        }?;

        state.cursor = match self.strategy {
            SelectionStrategy::Sticky => selected,
            SelectionStrategy::RoundRobin => (selected + 1) % n,
        };

        let account = &mut state.accounts[selected];
        account.last_used = Some(now);
        debug!(
            account_id = %account.id,
            index = selected,
            strategy = self.strategy.label(),
            "account selected"
        );
        Some(account.clone())
    }

    /// Smallest positive time until a rate-limited account frees up, or zero
    /// when no account is waiting on a rate limit.
    pub async fn min_wait_time(&self) -> Duration {
        let now = self.clock.now_millis();
        let state = self.state.read().await;
        state
            .accounts
            .iter()
            .filter(|a| a.rate_limit_reset_time > now)
            .map(|a| a.rate_limit_reset_time - now)
            .min()
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO)
    }

    /// Insert or replace by `id`.
    pub async fn add(&self, account: Account) {
        let mut state = self.state.write().await;
        match state.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => {
                info!(account_id = %account.id, "account replaced in pool");
                *existing = account;
            }
            None => {
                info!(account_id = %account.id, auth_method = account.auth.label(), "account added to pool");
                state.accounts.push(account);
            }
        }
    }

    /// Remove by `id`, keeping the cursor a valid index. Returns whether an
    /// account was removed.
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(idx) = state.accounts.iter().position(|a| a.id == id) else {
            return false;
        };
        state.accounts.remove(idx);

        if state.accounts.is_empty() {
            state.cursor = 0;
        } else {
            if idx <= state.cursor && state.cursor > 0 {
                state.cursor -= 1;
            }
            if state.cursor >= state.accounts.len() {
                state.cursor = 0;
            }
        }
        info!(account_id = id, remaining = state.accounts.len(), "account removed from pool");
        true
    }

    /// Hold the account until `now + duration`.
    pub async fn mark_rate_limited(&self, id: &str, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let until = self.clock.now_millis().saturating_add(millis);
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.id == id) {
            account.rate_limit_reset_time = until;
            info!(
                account_id = id,
                retry_after_secs = duration.as_secs(),
                "account rate limited"
            );
            metrics::counter!("pool_account_events_total", "event" => "rate_limited").increment(1);
        }
    }

    /// Take the account out of rotation until `recovery_at` (unix millis).
    pub async fn mark_unhealthy(&self, id: &str, reason: &str, recovery_at: u64) {
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.id == id) {
            account.mark_unhealthy(reason, recovery_at);
            warn!(account_id = id, reason, recovery_at, "account marked unhealthy");
            metrics::counter!("pool_account_events_total", "event" => "unhealthy").increment(1);
        }
    }

    /// Apply a refreshed credential. Returns the updated account.
    pub async fn update_credential(&self, id: &str, update: &CredentialUpdate) -> Option<Account> {
        let now = self.clock.now_millis();
        let mut state = self.state.write().await;
        let account = state.accounts.iter_mut().find(|a| a.id == id)?;

        account.static_key = update.static_key.clone();
        if let AuthMethod::OAuth {
            refresh_token,
            access_token,
            expires_at,
        } = &mut account.auth
        {
            if let Some(token) = &update.access_token {
                *access_token = Some(token.clone());
            }
            if let Some(token) = &update.refresh_token {
                *refresh_token = Some(token.clone());
            }
            if update.expires_at.is_some() {
                *expires_at = update.expires_at;
            }
        }
        if let Some(label) = update.label.as_deref().filter(|l| !l.is_empty()) {
            account.label = label.to_string();
        }
        account.last_used = Some(now);
        debug!(account_id = id, "account credential updated");
        Some(account.clone())
    }

    /// Health summary for the health endpoint. Never includes secrets.
    ///
    /// All available → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let now = self.clock.now_millis();
        let state = self.state.read().await;

        let mut accounts = Vec::with_capacity(state.accounts.len());
        let mut available = 0usize;
        let mut rate_limited = 0usize;
        let mut unhealthy = 0usize;

        for account in &state.accounts {
            let mut entry = serde_json::json!({
                "id": account.id,
                "label": account.label,
                "auth_method": account.auth.label(),
            });
            if !is_healthy_at(account, now) {
                unhealthy += 1;
                entry["status"] = "unhealthy".into();
                entry["unhealthy_reason"] = account.unhealthy_reason.clone().into();
                if let Some(recovery) = account.recovery_time {
                    entry["recovery_remaining_secs"] =
                        (recovery.saturating_sub(now).div_ceil(1000)).into();
                }
            } else if account.rate_limit_reset_time > now {
                rate_limited += 1;
                entry["status"] = "rate_limited".into();
                entry["rate_limit_remaining_secs"] =
                    ((account.rate_limit_reset_time - now).div_ceil(1000)).into();
            } else {
                available += 1;
                entry["status"] = "available".into();
            }
            accounts.push(entry);
        }

        let total = state.accounts.len();
        let status = if total > 0 && available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "strategy": self.strategy.label(),
            "accounts_total": total,
            "accounts_available": available,
            "accounts_rate_limited": rate_limited,
            "accounts_unhealthy": unhealthy,
            "accounts": accounts,
        })
    }
}

/// Healthy now, counting an elapsed recovery time as healthy.
fn is_healthy_at(account: &Account, now: u64) -> bool {
    account.is_healthy || account.recovery_time.is_some_and(|t| now >= t)
}

/// Availability check used by selection. Clears elapsed unhealthy markers.
fn check_available(account: &mut Account, now: u64) -> bool {
    if !account.is_healthy {
        match account.recovery_time {
            Some(recovery) if now >= recovery => {
                info!(
                    account_id = %account.id,
                    reason = account.unhealthy_reason.as_deref().unwrap_or_default(),
                    "account recovered"
                );
                account.clear_unhealthy();
                metrics::counter!("pool_account_events_total", "event" => "recovered").increment(1);
            }
            _ => return false,
        }
    }
    let rate_limit_clear = account.rate_limit_reset_time == 0 || now >= account.rate_limit_reset_time;
    rate_limit_clear && !account.static_key.is_empty()
}
