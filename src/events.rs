//! Protocol events consumed by the indexer, their log layouts, and the
//! [`EventSource`] seam through which they are fetched.

pub mod grouping;

use crate::abi::{self, AbiReader, Token};
use alloy_primitives::{keccak256, Address, Bytes, B256, I256, U256};
use anyhow::Result;
use futures::future::BoxFuture;
use std::fmt;

/// Location of an event on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawLog {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    PublishRequisition,
    CancelBlueprint,
    Tractor,
    OperatorReward,
    Sow,
    RemoveDeposit,
    RemoveDeposits,
    Convert,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::PublishRequisition,
        EventKind::CancelBlueprint,
        EventKind::Tractor,
        EventKind::OperatorReward,
        EventKind::Sow,
        EventKind::RemoveDeposit,
        EventKind::RemoveDeposits,
        EventKind::Convert,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PublishRequisition => "PublishRequisition",
            EventKind::CancelBlueprint => "CancelBlueprint",
            EventKind::Tractor => "Tractor",
            EventKind::OperatorReward => "OperatorReward",
            EventKind::Sow => "Sow",
            EventKind::RemoveDeposit => "RemoveDeposit",
            EventKind::RemoveDeposits => "RemoveDeposits",
            EventKind::Convert => "Convert",
        }
    }

    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::PublishRequisition => {
                "PublishRequisition(((address,bytes,bytes32[],uint256,uint256,uint256),bytes32,bytes))"
            }
            EventKind::CancelBlueprint => "CancelBlueprint(bytes32)",
            EventKind::Tractor => "Tractor(address,address,bytes32,uint256,uint256)",
            EventKind::OperatorReward => "OperatorReward(uint8,address,address,address,int256)",
            EventKind::Sow => "Sow(address,uint256,uint256,uint256,uint256)",
            EventKind::RemoveDeposit => "RemoveDeposit(address,address,int96,uint256,uint256)",
            EventKind::RemoveDeposits => {
                "RemoveDeposits(address,address,int96[],uint256[],uint256,uint256[])"
            }
            EventKind::Convert => "Convert(address,address,address,uint256,uint256)",
        }
    }

    pub fn topic(&self) -> B256 {
        keccak256(self.signature().as_bytes())
    }

    pub fn from_topic(topic: &B256) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.topic() == *topic)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signed blueprint as published on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requisition {
    pub publisher: Address,
    pub data: Bytes,
    pub operator_paste_instrs: Vec<B256>,
    pub max_nonce: U256,
    pub start_time: U256,
    pub end_time: U256,
    pub blueprint_hash: B256,
    pub signature: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TractorExecuted {
    pub operator: Address,
    pub publisher: Address,
    pub blueprint_hash: B256,
    pub nonce: U256,
    pub gas_remaining: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorReward {
    pub reward_type: u8,
    pub publisher: Address,
    pub operator: Address,
    pub token: Address,
    pub amount: I256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sown {
    pub account: Address,
    pub field_id: U256,
    pub index: U256,
    pub beans: U256,
    pub pods: U256,
}

/// Single or batched deposit removal, normalised to parallel vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositsRemoved {
    pub account: Address,
    pub token: Address,
    pub stems: Vec<I256>,
    pub amounts: Vec<U256>,
    pub bdvs: Vec<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converted {
    pub account: Address,
    pub from_token: Address,
    pub to_token: Address,
    pub from_amount: U256,
    pub to_amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventArgs {
    PublishRequisition(Requisition),
    CancelBlueprint { blueprint_hash: B256 },
    Tractor(TractorExecuted),
    OperatorReward(OperatorReward),
    Sow(Sown),
    RemoveDeposit(DepositsRemoved),
    RemoveDeposits(DepositsRemoved),
    Convert(Converted),
}

impl EventArgs {
    pub fn kind(&self) -> EventKind {
        match self {
            EventArgs::PublishRequisition(_) => EventKind::PublishRequisition,
            EventArgs::CancelBlueprint { .. } => EventKind::CancelBlueprint,
            EventArgs::Tractor(_) => EventKind::Tractor,
            EventArgs::OperatorReward(_) => EventKind::OperatorReward,
            EventArgs::Sow(_) => EventKind::Sow,
            EventArgs::RemoveDeposit(_) => EventKind::RemoveDeposit,
            EventArgs::RemoveDeposits(_) => EventKind::RemoveDeposits,
            EventArgs::Convert(_) => EventKind::Convert,
        }
    }

    /// Decodes a log given its topics and data. Returns `None` for unknown
    /// topics and malformed payloads.
    pub fn decode_log(topics: &[B256], data: &[u8]) -> Option<Self> {
        let kind = EventKind::from_topic(topics.first()?)?;
        let reader = AbiReader::new(data);
        let indexed = |position: usize| topics.get(position).map(|topic| Address::from_word(*topic));

        let args = match kind {
            EventKind::PublishRequisition => {
                let requisition = reader.tail(0)?;
                let blueprint = requisition.tail(0)?;
                EventArgs::PublishRequisition(Requisition {
                    publisher: blueprint.address(0)?,
                    data: Bytes::copy_from_slice(blueprint.bytes(1)?),
                    operator_paste_instrs: blueprint.fixed_array(2)?,
                    max_nonce: blueprint.uint(3)?,
                    start_time: blueprint.uint(4)?,
                    end_time: blueprint.uint(5)?,
                    blueprint_hash: requisition.fixed(1)?,
                    signature: Bytes::copy_from_slice(requisition.bytes(2)?),
                })
            }
            EventKind::CancelBlueprint => EventArgs::CancelBlueprint {
                blueprint_hash: reader.fixed(0)?,
            },
            EventKind::Tractor => EventArgs::Tractor(TractorExecuted {
                operator: indexed(1)?,
                publisher: indexed(2)?,
                blueprint_hash: *topics.get(3)?,
                nonce: reader.uint(0)?,
                gas_remaining: reader.uint(1)?,
            }),
            EventKind::OperatorReward => EventArgs::OperatorReward(OperatorReward {
                reward_type: reader.uint8(0)?,
                publisher: indexed(1)?,
                operator: indexed(2)?,
                token: reader.address(1)?,
                amount: reader.int(2)?,
            }),
            EventKind::Sow => EventArgs::Sow(Sown {
                account: indexed(1)?,
                field_id: reader.uint(0)?,
                index: reader.uint(1)?,
                beans: reader.uint(2)?,
                pods: reader.uint(3)?,
            }),
            EventKind::RemoveDeposit => EventArgs::RemoveDeposit(DepositsRemoved {
                account: indexed(1)?,
                token: indexed(2)?,
                stems: vec![reader.int(0)?],
                amounts: vec![reader.uint(1)?],
                bdvs: vec![reader.uint(2)?],
            }),
            EventKind::RemoveDeposits => {
                let removed = DepositsRemoved {
                    account: indexed(1)?,
                    token: indexed(2)?,
                    stems: reader.int_array(0)?,
                    amounts: reader.uint_array(1)?,
                    bdvs: reader.uint_array(3)?,
                };
                if removed.stems.len() != removed.bdvs.len() {
                    return None;
                }
                EventArgs::RemoveDeposits(removed)
            }
            EventKind::Convert => EventArgs::Convert(Converted {
                account: indexed(1)?,
                from_token: reader.address(0)?,
                to_token: reader.address(1)?,
                from_amount: reader.uint(2)?,
                to_amount: reader.uint(3)?,
            }),
        };
        Some(args)
    }

    /// Topics and data as the protocol would emit them.
    pub fn encode_log(&self) -> (Vec<B256>, Vec<u8>) {
        let topic0 = self.kind().topic();
        match self {
            EventArgs::PublishRequisition(req) => {
                let blueprint = Token::Tuple(vec![
                    Token::address(req.publisher),
                    Token::Bytes(req.data.to_vec()),
                    Token::Array(req.operator_paste_instrs.iter().copied().map(Token::fixed).collect()),
                    Token::uint(req.max_nonce),
                    Token::uint(req.start_time),
                    Token::uint(req.end_time),
                ]);
                let requisition = Token::Tuple(vec![
                    blueprint,
                    Token::fixed(req.blueprint_hash),
                    Token::Bytes(req.signature.to_vec()),
                ]);
                (vec![topic0], abi::encode(&[requisition]))
            }
            EventArgs::CancelBlueprint { blueprint_hash } => {
                (vec![topic0], abi::encode(&[Token::fixed(*blueprint_hash)]))
            }
            EventArgs::Tractor(evt) => (
                vec![
                    topic0,
                    evt.operator.into_word(),
                    evt.publisher.into_word(),
                    evt.blueprint_hash,
                ],
                abi::encode(&[Token::uint(evt.nonce), Token::uint(evt.gas_remaining)]),
            ),
            EventArgs::OperatorReward(evt) => (
                vec![topic0, evt.publisher.into_word(), evt.operator.into_word()],
                abi::encode(&[
                    Token::uint(U256::from(evt.reward_type)),
                    Token::address(evt.token),
                    Token::int(evt.amount),
                ]),
            ),
            EventArgs::Sow(evt) => (
                vec![topic0, evt.account.into_word()],
                abi::encode(&[
                    Token::uint(evt.field_id),
                    Token::uint(evt.index),
                    Token::uint(evt.beans),
                    Token::uint(evt.pods),
                ]),
            ),
            EventArgs::RemoveDeposit(evt) => (
                vec![topic0, evt.account.into_word(), evt.token.into_word()],
                abi::encode(&[
                    Token::int(evt.stems.first().copied().unwrap_or_default()),
                    Token::uint(evt.amounts.first().copied().unwrap_or_default()),
                    Token::uint(evt.bdvs.first().copied().unwrap_or_default()),
                ]),
            ),
            EventArgs::RemoveDeposits(evt) => {
                let total = evt.amounts.iter().fold(U256::ZERO, |acc, v| acc.saturating_add(*v));
                (
                    vec![topic0, evt.account.into_word(), evt.token.into_word()],
                    abi::encode(&[
                        Token::Array(evt.stems.iter().copied().map(Token::int).collect()),
                        Token::Array(evt.amounts.iter().copied().map(Token::uint).collect()),
                        Token::uint(total),
                        Token::Array(evt.bdvs.iter().copied().map(Token::uint).collect()),
                    ]),
                )
            }
            EventArgs::Convert(evt) => (
                vec![topic0, evt.account.into_word()],
                abi::encode(&[
                    Token::address(evt.from_token),
                    Token::address(evt.to_token),
                    Token::uint(evt.from_amount),
                    Token::uint(evt.to_amount),
                ]),
            ),
        }
    }
}

/// A decoded event together with where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub args: EventArgs,
    pub raw_log: RawLog,
}

impl Event {
    pub fn new(args: EventArgs, raw_log: RawLog) -> Self {
        Self { args, raw_log }
    }

    pub fn kind(&self) -> EventKind {
        self.args.kind()
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

/// Supplies block-ordered protocol events.
pub trait EventSource: Send + Sync {
    fn chain_head(&self) -> BoxFuture<'_, Result<u64>>;

    /// Events of the requested kinds in `[from, to]`, ordered by block then log index.
    fn fetch_events<'a>(
        &'a self,
        kinds: &'a [EventKind],
        from: u64,
        to: u64,
    ) -> BoxFuture<'a, Result<Vec<Event>>>;
}
