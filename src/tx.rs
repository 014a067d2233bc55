//! Transaction wire format.
//!
//! A transaction is the RLP encoding of [`SignedTx`]: a body plus a
//! recoverable secp256k1 signature over the keccak-256 hash of the RLP body.
//! Messages travel as `{kind, payload}` envelopes so the body can be decoded
//! without knowing every message type.

use alloy_primitives::{keccak256, Address, Bytes, Signature, B256, U256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use k256::ecdsa::SigningKey;
use thiserror::Error;

/// Message kind tags.
pub mod kinds {
    pub const SEND: u8 = 1;
    pub const DELEGATE: u8 = 2;
    pub const ORACLE_VOTE: u8 = 3;
    pub const EVM_CALL: u8 = 4;
}

/// Moves `amount` from `from` (the signer) to `to`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct MsgSend {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
}

/// Bonds `amount` of the signer's balance to `validator`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct MsgDelegate {
    pub validator: Address,
    pub amount: U256,
}

/// Price vote from a validator.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct MsgOracleVote {
    pub price: U256,
}

/// EVM-style call: value transfer plus optional storage writes.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct MsgEvmCall {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    Send(MsgSend),
    Delegate(MsgDelegate),
    OracleVote(MsgOracleVote),
    EvmCall(MsgEvmCall),
}

impl Msg {
    pub fn kind(&self) -> u8 {
        match self {
            Msg::Send(_) => kinds::SEND,
            Msg::Delegate(_) => kinds::DELEGATE,
            Msg::OracleVote(_) => kinds::ORACLE_VOTE,
            Msg::EvmCall(_) => kinds::EVM_CALL,
        }
    }

    pub fn to_envelope(&self) -> MsgEnvelope {
        let payload = match self {
            Msg::Send(msg) => alloy_rlp::encode(msg),
            Msg::Delegate(msg) => alloy_rlp::encode(msg),
            Msg::OracleVote(msg) => alloy_rlp::encode(msg),
            Msg::EvmCall(msg) => alloy_rlp::encode(msg),
        };
        MsgEnvelope {
            kind: self.kind(),
            payload: payload.into(),
        }
    }

    pub fn from_envelope(envelope: &MsgEnvelope) -> Result<Self, DecodeError> {
        let buf = &mut &envelope.payload[..];
        let msg = match envelope.kind {
            kinds::SEND => Msg::Send(MsgSend::decode(buf)?),
            kinds::DELEGATE => Msg::Delegate(MsgDelegate::decode(buf)?),
            kinds::ORACLE_VOTE => Msg::OracleVote(MsgOracleVote::decode(buf)?),
            kinds::EVM_CALL => Msg::EvmCall(MsgEvmCall::decode(buf)?),
            other => return Err(DecodeError::UnknownMsgKind(other)),
        };
        if !buf.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct MsgEnvelope {
    pub kind: u8,
    pub payload: Bytes,
}

/// The signed part of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TxBody {
    pub chain_id: u64,
    pub sender: Address,
    pub nonce: u64,
    /// Total fee offered, charged by the ante handler.
    pub fee: U256,
    pub gas_limit: u64,
    pub msgs: Vec<MsgEnvelope>,
}

impl TxBody {
    pub fn new(
        chain_id: u64,
        sender: Address,
        nonce: u64,
        fee: U256,
        gas_limit: u64,
        msgs: &[Msg],
    ) -> Self {
        Self {
            chain_id,
            sender,
            nonce,
            fee,
            gas_limit,
            msgs: msgs.iter().map(Msg::to_envelope).collect(),
        }
    }

    /// Hash that gets signed.
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Signs the body hash with `signing_key`.
    pub fn sign(self, signing_key: &SigningKey) -> Result<SignedTx, k256::ecdsa::Error> {
        let (sig, recovery_id) = signing_key.sign_prehash_recoverable(self.hash().as_slice())?;
        let signature = Signature::from_signature_and_parity(sig, recovery_id.is_y_odd());
        Ok(SignedTx {
            body: self,
            r: signature.r(),
            s: signature.s(),
            y_parity: signature.v(),
        })
    }
}

/// Wire form of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct SignedTx {
    pub body: TxBody,
    pub r: U256,
    pub s: U256,
    pub y_parity: bool,
}

impl SignedTx {
    pub fn encoded(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }
}

/// Errors decoding raw transaction bytes.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("malformed rlp: {0}")]
    Rlp(alloy_rlp::Error),
    #[error("unknown message kind {0}")]
    UnknownMsgKind(u8),
    #[error("trailing bytes after transaction")]
    TrailingBytes,
    #[error("transaction has no messages")]
    NoMessages,
}

impl From<alloy_rlp::Error> for DecodeError {
    fn from(err: alloy_rlp::Error) -> Self {
        DecodeError::Rlp(err)
    }
}

/// A decoded transaction.
#[derive(Debug, Clone)]
pub struct Tx {
    pub chain_id: u64,
    pub sender: Address,
    pub nonce: u64,
    pub fee: U256,
    pub gas_limit: u64,
    pub msgs: Vec<Msg>,
    pub hash: B256,
    pub signature: Signature,
    /// Length of the raw bytes, charged by the ante handler.
    pub size: usize,
}

impl Tx {
    /// Recovers the signer from the signature. This is the expensive part of
    /// the ante handler.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature.recover_address_from_prehash(&self.hash).ok()
    }

    pub fn verify(&self) -> bool {
        self.recover_signer() == Some(self.sender)
    }

    /// Oracle vote transactions may be executed ahead of the others.
    pub fn is_oracle_vote(&self) -> bool {
        self.msgs.iter().all(|msg| matches!(msg, Msg::OracleVote(_)))
    }

    /// Whether the transaction carries an EVM-style message.
    pub fn is_evm(&self) -> bool {
        self.msgs.iter().any(|msg| matches!(msg, Msg::EvmCall(_)))
    }
}

/// Decodes raw transaction bytes.
pub fn decode_tx(bytes: &[u8]) -> Result<Tx, DecodeError> {
    let buf = &mut &bytes[..];
    let signed = SignedTx::decode(buf)?;
    if !buf.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    if signed.body.msgs.is_empty() {
        return Err(DecodeError::NoMessages);
    }

    let msgs = signed
        .body
        .msgs
        .iter()
        .map(Msg::from_envelope)
        .collect::<Result<Vec<_>, _>>()?;
    let hash = signed.body.hash();
    let body = signed.body;

    Ok(Tx {
        chain_id: body.chain_id,
        sender: body.sender,
        nonce: body.nonce,
        fee: body.fee,
        gas_limit: body.gas_limit,
        msgs,
        hash,
        signature: Signature::new(signed.r, signed.s, signed.y_parity),
        size: bytes.len(),
    })
}
