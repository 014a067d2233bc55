//! Gas metering.

use crate::error::TxError;

/// Gas cost table for state access and ante checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasConfig {
    pub has_cost: u64,
    pub read_cost_flat: u64,
    pub read_cost_per_byte: u64,
    pub write_cost_flat: u64,
    pub write_cost_per_byte: u64,
    pub delete_cost: u64,
    pub iter_next_cost_flat: u64,
    pub tx_size_cost_per_byte: u64,
    pub sig_verify_cost: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            has_cost: 1000,
            read_cost_flat: 1000,
            read_cost_per_byte: 3,
            write_cost_flat: 2000,
            write_cost_per_byte: 30,
            delete_cost: 1000,
            iter_next_cost_flat: 30,
            tx_size_cost_per_byte: 10,
            sig_verify_cost: 1000,
        }
    }
}

/// Tracks gas consumed by one transaction against its limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasMeter {
    limit: u64,
    consumed: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self { limit, consumed: 0 }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Gas used as reported in results: never above the limit.
    pub fn used(&self) -> u64 {
        self.consumed.min(self.limit)
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }

    /// Charges `amount`. Consumption is recorded even when it overflows the
    /// limit.
    pub fn consume(&mut self, amount: u64, descriptor: &'static str) -> Result<(), TxError> {
        self.consumed = self.consumed.saturating_add(amount);
        if self.consumed > self.limit {
            return Err(TxError::OutOfGas {
                descriptor,
                limit: self.limit,
                used: self.consumed,
            });
        }
        Ok(())
    }
}

/// Intrinsic gas of an EVM-style call with `data`.
pub fn evm_intrinsic_gas(data: &[u8]) -> u64 {
    const TX_GAS: u64 = 21_000;
    const ZERO_BYTE: u64 = 4;
    const NON_ZERO_BYTE: u64 = 16;

    data.iter().fold(TX_GAS, |gas, &byte| {
        gas + if byte == 0 { ZERO_BYTE } else { NON_ZERO_BYTE }
    })
}
