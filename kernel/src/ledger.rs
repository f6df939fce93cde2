//! Scrip ledger: integer balances per principal, atomic transfers.
//!
//! Rows are created and destroyed only through the kernel's
//! `create_principal` / principal teardown paths, keeping the standing
//! invariant (artifact with `has_standing` ⇔ ledger row) enforceable in one
//! place.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::types::PrincipalId;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Ledger {
    balances: IndexMap<PrincipalId, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent row creation at zero balance.
    pub fn ensure_row(&mut self, principal: &str) {
        self.balances.entry(principal.to_string()).or_insert(0);
    }

    pub fn has_row(&self, principal: &str) -> bool {
        self.balances.contains_key(principal)
    }

    pub fn drop_row(&mut self, principal: &str) -> KernelResult<()> {
        match self.balances.get(principal) {
            None => Ok(()),
            Some(0) => {
                self.balances.shift_remove(principal);
                Ok(())
            }
            Some(balance) => Err(KernelError::System(format!(
                "cannot drop ledger row for {} holding {} scrip",
                principal, balance
            ))),
        }
    }

    /// Drift repair: remove a row regardless of balance. Only checkpoint
    /// restore uses this, for rows whose principal artifact is gone.
    pub(crate) fn purge_row(&mut self, principal: &str) {
        self.balances.shift_remove(principal);
    }

    pub fn balance(&self, principal: &str) -> KernelResult<u64> {
        self.balances
            .get(principal)
            .copied()
            .ok_or_else(|| KernelError::NotFound(format!("ledger row for {}", principal)))
    }

    pub fn credit(&mut self, principal: &str, amount: u64) -> KernelResult<()> {
        let balance = self
            .balances
            .get_mut(principal)
            .ok_or_else(|| KernelError::NotFound(format!("ledger row for {}", principal)))?;
        *balance = balance.checked_add(amount).ok_or_else(|| {
            KernelError::System(format!("scrip overflow crediting {} to {}", amount, principal))
        })?;
        Ok(())
    }

    pub fn debit(&mut self, principal: &str, amount: u64) -> KernelResult<()> {
        let balance = self
            .balances
            .get_mut(principal)
            .ok_or_else(|| KernelError::NotFound(format!("ledger row for {}", principal)))?;
        if *balance < amount {
            return Err(KernelError::InsufficientFunds {
                principal: principal.to_string(),
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    /// Atomic debit/credit pair: both sides succeed or neither. The debit is
    /// checked before either side mutates, so a failure leaves no partial
    /// state.
    pub fn transfer(&mut self, from: &str, to: &str, amount: u64) -> KernelResult<()> {
        if !self.has_row(to) {
            return Err(KernelError::NotFound(format!("ledger row for {}", to)));
        }
        self.debit(from, amount)?;
        self.credit(to, amount)
            .expect("credit after successful debit cannot fail for an existing row");
        Ok(())
    }

    pub fn total_scrip(&self) -> u64 {
        self.balances.values().sum()
    }

    pub fn rows(&self) -> impl Iterator<Item = (&PrincipalId, &u64)> {
        self.balances.iter()
    }

    pub(crate) fn snapshot(&self) -> IndexMap<PrincipalId, u64> {
        self.balances.clone()
    }

    pub(crate) fn restore(snapshot: IndexMap<PrincipalId, u64>) -> Self {
        Self { balances: snapshot }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ledger_with(alice: u64, bob: u64) -> Ledger {
        let mut ledger = Ledger::new();
        ledger.ensure_row("alice");
        ledger.ensure_row("bob");
        ledger.credit("alice", alice).unwrap();
        ledger.credit("bob", bob).unwrap();
        ledger
    }

    #[test]
    fn transfer_moves_exactly_n() {
        let mut ledger = ledger_with(100, 0);
        ledger.transfer("alice", "bob", 30).unwrap();
        assert_eq!(ledger.balance("alice").unwrap(), 70);
        assert_eq!(ledger.balance("bob").unwrap(), 30);
        assert_eq!(ledger.total_scrip(), 100);
    }

    #[test]
    fn transfer_is_atomic_on_insufficient_funds() {
        let mut ledger = ledger_with(10, 5);
        let err = ledger.transfer("alice", "bob", 11).unwrap_err();
        assert!(matches!(err, KernelError::InsufficientFunds { .. }));
        assert_eq!(ledger.balance("alice").unwrap(), 10);
        assert_eq!(ledger.balance("bob").unwrap(), 5);
    }

    #[test]
    fn transfer_to_missing_row_leaves_sender_untouched() {
        let mut ledger = ledger_with(10, 0);
        let err = ledger.transfer("alice", "carol", 5).unwrap_err();
        assert!(matches!(err, KernelError::NotFound(_)));
        assert_eq!(ledger.balance("alice").unwrap(), 10);
    }

    #[test]
    fn drop_row_refuses_nonzero_balances() {
        let mut ledger = ledger_with(10, 0);
        assert!(ledger.drop_row("alice").is_err());
        ledger.drop_row("bob").unwrap();
        assert!(!ledger.has_row("bob"));
    }
}
