//! Key custody. Every mutation touches the KeyLock and the per-user vault
//! aggregate (and the room's locked total) inside one store transaction, so
//! `vault.total_keys_locked` never drifts from the sum of active locks.

use std::sync::Arc;

use crate::clock::TimeSource;
use crate::error::{CoreError, CoreResult};
use crate::logging::{json_log, obj, v_int, v_str, Domain};
use crate::oracle::BalanceOracle;
use crate::store::{self, Store};
use crate::types::{new_id, EarningsSource, KeyLock, LockStatus, RefundEntry, Vault};

pub struct VaultService {
    store: Arc<Store>,
    clock: Arc<dyn TimeSource>,
    oracle: Arc<dyn BalanceOracle>,
}

impl VaultService {
    pub fn new(store: Arc<Store>, clock: Arc<dyn TimeSource>, oracle: Arc<dyn BalanceOracle>) -> Self {
        Self { store, clock, oracle }
    }

    /// Consult the balance oracle, then lock. Oracle failures are transient
    /// and surface unchanged; nothing is written before verification passes.
    pub async fn lock_keys(
        &self,
        user_id: &str,
        room_id: &str,
        amount: u64,
        wallet_address: &str,
    ) -> CoreResult<KeyLock> {
        let balance = self.oracle.get_balance(wallet_address, user_id).await?;
        self.lock_keys_verified(user_id, room_id, amount, balance)
    }

    /// Lock with an already-verified balance. One active lock per (user, room).
    pub fn lock_keys_verified(
        &self,
        user_id: &str,
        room_id: &str,
        amount: u64,
        verified_balance: u64,
    ) -> CoreResult<KeyLock> {
        if verified_balance < amount {
            return Err(CoreError::InsufficientBalance { have: verified_balance, need: amount });
        }
        let now = self.clock.now();
        let lock = self.store.with_tx(|tx| {
            if store::find_active_lock(tx, user_id, room_id)?.is_some() {
                return Err(CoreError::AlreadyLocked {
                    user_id: user_id.to_string(),
                    room_id: room_id.to_string(),
                });
            }
            let lock = KeyLock {
                id: new_id("lk"),
                user_id: user_id.to_string(),
                room_id: room_id.to_string(),
                amount,
                status: LockStatus::Locked,
                locked_at: now,
                unlocked_at: None,
            };
            store::put_lock(tx, &lock)?;

            let mut vault = store::get_vault(tx, user_id)?
                .unwrap_or_else(|| Vault::new(user_id, now));
            vault.total_keys_locked += amount;
            vault.updated_at = now;
            store::put_vault(tx, &vault)?;

            if let Some(mut room) = store::get_room(tx, room_id)? {
                room.total_keys_locked += amount;
                store::put_room(tx, &room)?;
            }
            Ok(lock)
        })?;
        json_log(
            Domain::Vault,
            "keys.locked",
            obj(&[
                ("lock_id", v_str(&lock.id)),
                ("user_id", v_str(user_id)),
                ("room_id", v_str(room_id)),
                ("amount", v_int(amount as i64)),
            ]),
        );
        Ok(lock)
    }

    /// Return locked keys to the user. `NotLocked` on a second call makes
    /// retries safe: the first transition wins, later ones are no-op errors.
    pub fn release_keys(&self, lock_id: &str) -> CoreResult<KeyLock> {
        let lock = self.unlock(lock_id, LockStatus::Released)?;
        json_log(
            Domain::Vault,
            "keys.released",
            obj(&[
                ("lock_id", v_str(&lock.id)),
                ("user_id", v_str(&lock.user_id)),
                ("amount", v_int(lock.amount as i64)),
            ]),
        );
        Ok(lock)
    }

    /// Forfeit locked keys. The forfeiture is recorded here; crediting the
    /// platform/curator pool is an external concern.
    pub fn forfeit_keys(&self, lock_id: &str) -> CoreResult<KeyLock> {
        let lock = self.unlock(lock_id, LockStatus::Forfeited)?;
        json_log(
            Domain::Vault,
            "keys.forfeited",
            obj(&[
                ("lock_id", v_str(&lock.id)),
                ("user_id", v_str(&lock.user_id)),
                ("amount", v_int(lock.amount as i64)),
            ]),
        );
        Ok(lock)
    }

    fn unlock(&self, lock_id: &str, to: LockStatus) -> CoreResult<KeyLock> {
        let now = self.clock.now();
        self.store.with_tx(|tx| unlock_in_tx(tx, lock_id, to, now))
    }

    /// Credit a reward balance and its per-source breakdown. Negative amounts
    /// are clamped out so no balance can go down through this path.
    pub fn add_earnings(
        &self,
        user_id: &str,
        amount: f64,
        currency: &str,
        source: EarningsSource,
    ) -> CoreResult<Vault> {
        let amount = amount.max(0.0);
        let now = self.clock.now();
        let vault = self.store.with_tx(|tx| {
            let mut vault = store::get_vault(tx, user_id)?
                .unwrap_or_else(|| Vault::new(user_id, now));
            *vault.balances.entry(currency.to_string()).or_insert(0.0) += amount;
            *vault.earnings_by_source.entry(source).or_insert(0.0) += amount;
            vault.updated_at = now;
            store::put_vault(tx, &vault)?;
            Ok(vault)
        })?;
        json_log(
            Domain::Vault,
            "earnings.credited",
            obj(&[
                ("user_id", v_str(user_id)),
                ("currency", v_str(currency)),
                ("source", v_str(source.as_str())),
            ]),
        );
        Ok(vault)
    }

    /// Vault read; unknown users get an empty (unpersisted) vault.
    pub fn get_vault(&self, user_id: &str) -> CoreResult<Vault> {
        let now = self.clock.now();
        self.store.read(|conn| {
            Ok(store::get_vault(conn, user_id)?.unwrap_or_else(|| Vault::new(user_id, now)))
        })
    }

    pub fn get_lock(&self, lock_id: &str) -> CoreResult<KeyLock> {
        self.store.read(|conn| store::require_lock(conn, lock_id))
    }
}

/// Flip a lock out of `locked` and keep the vault and room aggregates in
/// step, all against the caller's transaction. The queue service settles
/// through this so release/forfeit commits atomically with the application
/// mutation that caused it.
pub(crate) fn unlock_in_tx(
    conn: &rusqlite::Connection,
    lock_id: &str,
    to: LockStatus,
    now: chrono::DateTime<chrono::Utc>,
) -> CoreResult<KeyLock> {
    let mut lock = store::require_lock(conn, lock_id)?;
    if lock.status != LockStatus::Locked {
        return Err(CoreError::NotLocked { lock_id: lock_id.to_string() });
    }
    lock.status = to;
    lock.unlocked_at = Some(now);
    store::put_lock(conn, &lock)?;

    let mut vault = store::get_vault(conn, &lock.user_id)?
        .unwrap_or_else(|| Vault::new(&lock.user_id, now));
    vault.total_keys_locked = vault.total_keys_locked.saturating_sub(lock.amount);
    if to == LockStatus::Released {
        vault.refund_history.push(RefundEntry {
            room_id: lock.room_id.clone(),
            lock_id: lock.id.clone(),
            amount: lock.amount,
            at: now,
        });
    }
    vault.updated_at = now;
    store::put_vault(conn, &vault)?;

    if let Some(mut room) = store::get_room(conn, &lock.room_id)? {
        room.total_keys_locked = room.total_keys_locked.saturating_sub(lock.amount);
        store::put_room(conn, &room)?;
    }
    Ok(lock)
}
