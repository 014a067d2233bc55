//! Runs one transaction against a [`TxnState`]: ante handler, then messages.

use crate::ante::AnteHandler;
use crate::context::{BlockMeta, Event, TxContext};
use crate::error::{codes, TxError, CODESPACE};
use crate::gas::GasConfig;
use crate::router::{EvmTxInfo, MsgRouter};
use crate::tx::{DecodeError, Tx};
use occ_executor::{Abort, TxnState};

/// A transaction as it sits in the block: its absolute position and the
/// outcome of decoding its bytes.
#[derive(Debug, Clone)]
pub struct BlockTx {
    pub index: usize,
    pub decoded: Result<Tx, DecodeError>,
}

impl BlockTx {
    pub fn tx(&self) -> Option<&Tx> {
        self.decoded.as_ref().ok()
    }
}

/// Per-transaction result record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTxResult {
    pub code: u32,
    pub codespace: String,
    pub gas_wanted: u64,
    pub gas_used: u64,
    pub log: String,
    pub events: Vec<Event>,
    pub evm_tx_info: Option<EvmTxInfo>,
}

impl ExecTxResult {
    pub fn is_ok(&self) -> bool {
        self.code == codes::OK
    }

    fn failed(err: &TxError, gas_wanted: u64, gas_used: u64) -> Self {
        Self {
            code: err.code(),
            codespace: CODESPACE.to_string(),
            gas_wanted,
            gas_used,
            log: err.to_string(),
            events: Vec::new(),
            evm_tx_info: None,
        }
    }
}

/// Bridges a transaction to whatever state backs it.
///
/// The processor never touches the canonical store: every read and write
/// goes through the supplied [`TxnState`]. Conflicts come back as
/// `Err(Abort)`; every other failure is a result with a non-zero code.
pub struct TxProcessor<'a> {
    pub ante: &'a dyn AnteHandler,
    pub router: &'a MsgRouter,
    pub gas_config: &'a GasConfig,
    pub meta: &'a BlockMeta,
}

impl TxProcessor<'_> {
    pub fn process(
        &self,
        state: &mut dyn TxnState,
        block_tx: &BlockTx,
    ) -> Result<ExecTxResult, Abort> {
        let tx = match &block_tx.decoded {
            Ok(tx) => tx,
            Err(err) => {
                let err = TxError::app(codes::TX_DECODE, err.to_string());
                return Ok(ExecTxResult::failed(&err, 0, 0));
            }
        };

        let mut ctx = TxContext::new(
            state,
            tx.gas_limit,
            self.gas_config,
            self.meta,
            block_tx.index,
        );

        let start = ctx.checkpoint();
        if let Err(err) = self.ante.run(&mut ctx, tx) {
            if let TxError::Abort(abort) = err {
                return Err(abort);
            }
            ctx.revert_to(start);
            return Ok(ExecTxResult::failed(&err, tx.gas_limit, ctx.gas().used()));
        }

        let before_msgs = ctx.checkpoint();
        let outcome = self.router.deliver(&mut ctx, tx);
        let vm_error = match outcome {
            Ok(()) => None,
            Err(TxError::Abort(abort)) => return Err(abort),
            Err(err) => {
                ctx.revert_to(before_msgs);
                Some(err)
            }
        };

        let evm_tx_info = tx.is_evm().then(|| EvmTxInfo {
            sender: tx.sender,
            nonce: tx.nonce,
            tx_hash: tx.hash,
            vm_error: vm_error.as_ref().map(ToString::to_string).unwrap_or_default(),
        });

        let gas_used = ctx.gas().used();
        let events = ctx.into_events();
        Ok(match vm_error {
            None => ExecTxResult {
                code: codes::OK,
                codespace: String::new(),
                gas_wanted: tx.gas_limit,
                gas_used,
                log: String::new(),
                events,
                evm_tx_info,
            },
            Some(err) => ExecTxResult {
                events,
                evm_tx_info,
                ..ExecTxResult::failed(&err, tx.gas_limit, gas_used)
            },
        })
    }
}
