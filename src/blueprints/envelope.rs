//! The farm/pipe wrapper every known blueprint payload travels in:
//! `advancedFarm([advancedPipe([(target, call), ...], value)])`.

use crate::abi::{self, AbiReader, Token};
use alloy_primitives::{Address, I256, U256};
use once_cell::sync::Lazy;

pub static ADVANCED_FARM: Lazy<[u8; 4]> =
    Lazy::new(|| abi::selector("advancedFarm((bytes,bytes)[])"));
pub static ADVANCED_PIPE: Lazy<[u8; 4]> =
    Lazy::new(|| abi::selector("advancedPipe((address,bytes,bytes)[],uint256)"));

/// One call forwarded through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeCall<'a> {
    pub target: Address,
    pub call_data: &'a [u8],
}

/// Extracts the first pipe call of the first farm step.
///
/// Any other shape (different selectors, empty lists, truncated words) yields `None`.
pub fn first_pipe_call(data: &[u8]) -> Option<PipeCall<'_>> {
    let farm = AbiReader::call(data, *ADVANCED_FARM)?;
    let step = farm.tuple_array(0)?.into_iter().next()?;
    let pipe = AbiReader::call(step.bytes(0)?, *ADVANCED_PIPE)?;
    let call = pipe.tuple_array(0)?.into_iter().next()?;
    Some(PipeCall {
        target: call.address(0)?,
        call_data: call.bytes(1)?,
    })
}

/// Returns the inner call data when the first pipe call targets `target`.
pub fn call_for(data: &[u8], target: Address) -> Option<&[u8]> {
    first_pipe_call(data)
        .filter(|call| call.target == target)
        .map(|call| call.call_data)
}

/// Operator terms every blueprint carries next to its own parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorParams {
    pub whitelisted_operators: Vec<Address>,
    pub tip_address: Address,
    pub operator_tip_amount: I256,
}

impl OperatorParams {
    pub fn decode(reader: &AbiReader<'_>) -> Option<Self> {
        Some(Self {
            whitelisted_operators: reader.address_array(0)?,
            tip_address: reader.address(1)?,
            operator_tip_amount: reader.int(2)?,
        })
    }

    pub fn token(&self) -> Token {
        Token::Tuple(vec![
            Token::Array(
                self.whitelisted_operators
                    .iter()
                    .copied()
                    .map(Token::address)
                    .collect(),
            ),
            Token::address(self.tip_address),
            Token::int(self.operator_tip_amount),
        ])
    }

    /// Offered tip; a negative amount (the publisher is paid) offers nothing.
    pub fn offered_tip(&self) -> U256 {
        if self.operator_tip_amount.is_negative() {
            U256::ZERO
        } else {
            self.operator_tip_amount.unsigned_abs()
        }
    }
}

/// Wraps `call_data` for `target` in a single-step farm/pipe envelope.
pub fn wrap(target: Address, call_data: Vec<u8>) -> Vec<u8> {
    let pipe = abi::encode_call(
        *ADVANCED_PIPE,
        &[
            Token::Array(vec![Token::Tuple(vec![
                Token::address(target),
                Token::Bytes(call_data),
                Token::Bytes(Vec::new()),
            ])]),
            Token::uint(U256::ZERO),
        ],
    );
    abi::encode_call(
        *ADVANCED_FARM,
        &[Token::Array(vec![Token::Tuple(vec![
            Token::Bytes(pipe),
            Token::Bytes(Vec::new()),
        ])])],
    )
}
