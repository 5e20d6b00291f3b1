//! Minimal Solidity ABI plumbing: a bounds-checked word reader used to decode
//! event logs and blueprint calldata, plus a small encoder for building call
//! payloads.
//!
//! Every accessor on [`AbiReader`] returns `Option` so callers can probe
//! arbitrary, possibly truncated payloads without ever panicking.

use alloy_primitives::{keccak256, Address, B256, I256, U256};

const WORD: usize = 32;

/// Read-only view over an ABI encoded head/tail region.
#[derive(Debug, Clone, Copy)]
pub struct AbiReader<'a> {
    data: &'a [u8],
}

impl<'a> AbiReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns a reader over the call arguments when `data` starts with `selector`.
    pub fn call(data: &'a [u8], selector: [u8; 4]) -> Option<Self> {
        let (head, rest) = data.split_first_chunk::<4>()?;
        (*head == selector).then(|| Self::new(rest))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn word(&self, index: usize) -> Option<&'a [u8; WORD]> {
        let start = index.checked_mul(WORD)?;
        let end = start.checked_add(WORD)?;
        self.data.get(start..end)?.try_into().ok()
    }

    pub fn uint(&self, index: usize) -> Option<U256> {
        self.word(index).map(|word| U256::from_be_bytes(*word))
    }

    pub fn int(&self, index: usize) -> Option<I256> {
        self.word(index).map(|word| I256::from_be_bytes(*word))
    }

    pub fn fixed(&self, index: usize) -> Option<B256> {
        self.word(index).map(|word| B256::from(*word))
    }

    pub fn boolean(&self, index: usize) -> Option<bool> {
        match self.small(index)? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    /// Decodes a left-padded address, rejecting words with dirty high bytes.
    pub fn address(&self, index: usize) -> Option<Address> {
        let word = self.word(index)?;
        if word[..12].iter().any(|byte| *byte != 0) {
            return None;
        }
        Some(Address::from_slice(&word[12..]))
    }

    pub fn small(&self, index: usize) -> Option<usize> {
        usize::try_from(self.uint(index)?).ok()
    }

    pub fn uint8(&self, index: usize) -> Option<u8> {
        u8::try_from(self.uint(index)?).ok()
    }

    /// Follows the offset stored at `index` and returns a reader positioned at its tail.
    pub fn tail(&self, index: usize) -> Option<Self> {
        let offset = self.small(index)?;
        self.data.get(offset..).map(Self::new)
    }

    /// Dynamic `bytes` referenced from the head slot `index`.
    pub fn bytes(&self, index: usize) -> Option<&'a [u8]> {
        let tail = self.tail(index)?;
        let len = tail.small(0)?;
        let end = WORD.checked_add(len)?;
        tail.data.get(WORD..end)
    }

    /// Dynamic array referenced from `index`: element count plus a reader over the elements.
    pub fn array(&self, index: usize) -> Option<(usize, Self)> {
        let tail = self.tail(index)?;
        let len = tail.small(0)?;
        let elements = Self::new(tail.data.get(WORD..)?);
        if len > elements.len() / WORD {
            return None;
        }
        Some((len, elements))
    }

    pub fn uint_array(&self, index: usize) -> Option<Vec<U256>> {
        let (len, elements) = self.array(index)?;
        (0..len).map(|i| elements.uint(i)).collect()
    }

    pub fn int_array(&self, index: usize) -> Option<Vec<I256>> {
        let (len, elements) = self.array(index)?;
        (0..len).map(|i| elements.int(i)).collect()
    }

    pub fn uint8_array(&self, index: usize) -> Option<Vec<u8>> {
        let (len, elements) = self.array(index)?;
        (0..len).map(|i| elements.uint8(i)).collect()
    }

    pub fn address_array(&self, index: usize) -> Option<Vec<Address>> {
        let (len, elements) = self.array(index)?;
        (0..len).map(|i| elements.address(i)).collect()
    }

    pub fn fixed_array(&self, index: usize) -> Option<Vec<B256>> {
        let (len, elements) = self.array(index)?;
        (0..len).map(|i| elements.fixed(i)).collect()
    }

    /// Array whose elements are themselves dynamic tuples.
    pub fn tuple_array(&self, index: usize) -> Option<Vec<Self>> {
        let (len, elements) = self.array(index)?;
        (0..len).map(|i| elements.tail(i)).collect()
    }
}

/// First four bytes of the keccak hash of a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

/// Value tree accepted by [`encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word([u8; WORD]),
    Bytes(Vec<u8>),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    pub fn uint(value: U256) -> Self {
        Token::Word(value.to_be_bytes::<WORD>())
    }

    pub fn int(value: I256) -> Self {
        Token::Word(value.to_be_bytes::<WORD>())
    }

    pub fn address(value: Address) -> Self {
        let mut word = [0u8; WORD];
        word[12..].copy_from_slice(value.as_slice());
        Token::Word(word)
    }

    pub fn fixed(value: B256) -> Self {
        Token::Word(value.0)
    }

    pub fn boolean(value: bool) -> Self {
        Token::uint(U256::from(u8::from(value)))
    }

    fn is_dynamic(&self) -> bool {
        match self {
            Token::Word(_) => false,
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(items) => items.iter().any(Token::is_dynamic),
        }
    }

    fn head_len(&self) -> usize {
        match self {
            Token::Tuple(items) if !self.is_dynamic() => items.iter().map(Token::head_len).sum(),
            _ => WORD,
        }
    }

    fn encode_static(&self, out: &mut Vec<u8>) {
        match self {
            Token::Word(word) => out.extend_from_slice(word),
            Token::Tuple(items) => items.iter().for_each(|item| item.encode_static(out)),
            Token::Bytes(_) | Token::Array(_) => {}
        }
    }

    fn encode_tail(&self, out: &mut Vec<u8>) {
        match self {
            Token::Bytes(bytes) => {
                out.extend_from_slice(&usize_word(bytes.len()));
                out.extend_from_slice(bytes);
                let padding = (WORD - bytes.len() % WORD) % WORD;
                out.resize(out.len() + padding, 0);
            }
            Token::Array(items) => {
                out.extend_from_slice(&usize_word(items.len()));
                out.extend(encode(items));
            }
            Token::Tuple(items) => out.extend(encode(items)),
            Token::Word(_) => self.encode_static(out),
        }
    }
}

/// Encodes `tokens` as an ABI tuple (function arguments or event data).
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len: usize = tokens.iter().map(Token::head_len).sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&usize_word(head_len + tail.len()));
            token.encode_tail(&mut tail);
        } else {
            token.encode_static(&mut head);
        }
    }

    head.extend(tail);
    head
}

/// Selector followed by the encoded arguments.
pub fn encode_call(selector: [u8; 4], args: &[Token]) -> Vec<u8> {
    let mut out = selector.to_vec();
    out.extend(encode(args));
    out
}

fn usize_word(value: usize) -> [u8; WORD] {
    U256::from(value).to_be_bytes::<WORD>()
}
