//! ABI coding for the oracle contract write path.
//!
//! Only the three functions the node touches are encoded here; the admin
//! surface belongs to external tooling. Scores travel as int128 in
//! two's-complement over 256 bits.

use crate::types::OracleEntry;
use ethers_core::abi::{decode, encode, ParamType, Token};
use ethers_core::types::{Address, Bytes, U256};
use ethers_core::utils::id;
use thiserror::Error;

const UPDATE_SIG: &str = "updateSentiment(address,int128,uint32,uint16)";
const BATCH_SIG: &str = "batchUpdateSentiment(address[],int128[],uint32[],uint16[])";
const GET_SIG: &str = "getSentiment(address)";

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("calldata too short")]
    TooShort,
    #[error("unknown function selector")]
    UnknownSelector,
    #[error("abi decode failed: {0}")]
    Decode(String),
    #[error("value does not fit int128")]
    IntOverflow,
}

/// One decoded inbound call, used by the simulated chain.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleCall {
    Update {
        asset: Address,
        score_fp: i128,
        sample_size: u32,
        confidence_bp: u16,
    },
    BatchUpdate {
        assets: Vec<Address>,
        scores_fp: Vec<i128>,
        sample_sizes: Vec<u32>,
        confidences_bp: Vec<u16>,
    },
    Get {
        asset: Address,
    },
}

/// int128 -> two's-complement U256.
pub fn int128_to_u256(value: i128) -> U256 {
    if value >= 0 {
        U256::from(value as u128)
    } else {
        U256::MAX - U256::from(value.unsigned_abs()) + U256::one()
    }
}

/// Two's-complement U256 -> int128. Fails when the value was not a
/// sign-extended int128.
pub fn u256_to_int128(value: U256) -> Result<i128, AbiError> {
    let max_positive = U256::from(i128::MAX as u128);
    if value <= max_positive {
        return Ok(value.as_u128() as i128);
    }
    let magnitude = U256::MAX - value + U256::one();
    let min_magnitude = U256::from(1u8) << 127;
    if magnitude > min_magnitude {
        return Err(AbiError::IntOverflow);
    }
    if magnitude == min_magnitude {
        return Ok(i128::MIN);
    }
    Ok(-(magnitude.as_u128() as i128))
}

fn with_selector(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(encode(tokens));
    Bytes::from(data)
}

/// Calldata for a single-asset update.
pub fn encode_update(asset: Address, score_fp: i128, sample_size: u32, confidence_bp: u16) -> Bytes {
    with_selector(
        UPDATE_SIG,
        &[
            Token::Address(asset),
            Token::Int(int128_to_u256(score_fp)),
            Token::Uint(U256::from(sample_size)),
            Token::Uint(U256::from(confidence_bp)),
        ],
    )
}

/// Calldata for a batch update. Caller is responsible for the 50-element
/// cap; the contract rejects anything larger.
pub fn encode_batch_update(elements: &[(Address, i128, u32, u16)]) -> Bytes {
    let assets = elements.iter().map(|e| Token::Address(e.0)).collect();
    let scores = elements
        .iter()
        .map(|e| Token::Int(int128_to_u256(e.1)))
        .collect();
    let sizes = elements
        .iter()
        .map(|e| Token::Uint(U256::from(e.2)))
        .collect();
    let confidences = elements
        .iter()
        .map(|e| Token::Uint(U256::from(e.3)))
        .collect();
    with_selector(
        BATCH_SIG,
        &[
            Token::Array(assets),
            Token::Array(scores),
            Token::Array(sizes),
            Token::Array(confidences),
        ],
    )
}

/// Calldata for the latest-entry read.
pub fn encode_get(asset: Address) -> Bytes {
    with_selector(GET_SIG, &[Token::Address(asset)])
}

/// Return-data encoding of `getSentiment`: (int128, uint64, uint32, uint16).
pub fn encode_entry(entry: &OracleEntry) -> Bytes {
    Bytes::from(encode(&[
        Token::Int(int128_to_u256(entry.score_fp)),
        Token::Uint(U256::from(entry.timestamp)),
        Token::Uint(U256::from(entry.sample_size)),
        Token::Uint(U256::from(entry.confidence_bp)),
    ]))
}

/// Decode the `getSentiment` return data.
pub fn decode_entry(data: &[u8]) -> Result<OracleEntry, AbiError> {
    let tokens = decode(
        &[
            ParamType::Int(128),
            ParamType::Uint(64),
            ParamType::Uint(32),
            ParamType::Uint(16),
        ],
        data,
    )
    .map_err(|e| AbiError::Decode(e.to_string()))?;

    Ok(OracleEntry {
        score_fp: u256_to_int128(expect_uint(&tokens[0])?)?,
        timestamp: expect_uint(&tokens[1])?.low_u64(),
        sample_size: expect_uint(&tokens[2])?.low_u32(),
        confidence_bp: expect_uint(&tokens[3])?.low_u32() as u16,
    })
}

fn expect_uint(token: &Token) -> Result<U256, AbiError> {
    match token {
        Token::Uint(value) | Token::Int(value) => Ok(*value),
        other => Err(AbiError::Decode(format!("unexpected token {:?}", other))),
    }
}

fn expect_address(token: &Token) -> Result<Address, AbiError> {
    match token {
        Token::Address(address) => Ok(*address),
        other => Err(AbiError::Decode(format!("unexpected token {:?}", other))),
    }
}

/// Decode inbound calldata into one of the known oracle calls.
pub fn decode_call(data: &[u8]) -> Result<OracleCall, AbiError> {
    if data.len() < 4 {
        return Err(AbiError::TooShort);
    }
    let (selector, payload) = data.split_at(4);

    if selector == id(UPDATE_SIG).as_slice() {
        let tokens = decode(
            &[
                ParamType::Address,
                ParamType::Int(128),
                ParamType::Uint(32),
                ParamType::Uint(16),
            ],
            payload,
        )
        .map_err(|e| AbiError::Decode(e.to_string()))?;
        return Ok(OracleCall::Update {
            asset: expect_address(&tokens[0])?,
            score_fp: u256_to_int128(expect_uint(&tokens[1])?)?,
            sample_size: expect_uint(&tokens[2])?.low_u32(),
            confidence_bp: expect_uint(&tokens[3])?.low_u32() as u16,
        });
    }

    if selector == id(BATCH_SIG).as_slice() {
        let tokens = decode(
            &[
                ParamType::Array(Box::new(ParamType::Address)),
                ParamType::Array(Box::new(ParamType::Int(128))),
                ParamType::Array(Box::new(ParamType::Uint(32))),
                ParamType::Array(Box::new(ParamType::Uint(16))),
            ],
            payload,
        )
        .map_err(|e| AbiError::Decode(e.to_string()))?;

        let unwrap_array = |token: &Token| -> Result<Vec<Token>, AbiError> {
            match token {
                Token::Array(inner) => Ok(inner.clone()),
                other => Err(AbiError::Decode(format!("unexpected token {:?}", other))),
            }
        };

        let assets = unwrap_array(&tokens[0])?
            .iter()
            .map(expect_address)
            .collect::<Result<Vec<_>, _>>()?;
        let scores_fp = unwrap_array(&tokens[1])?
            .iter()
            .map(|t| expect_uint(t).and_then(u256_to_int128))
            .collect::<Result<Vec<_>, _>>()?;
        let sample_sizes = unwrap_array(&tokens[2])?
            .iter()
            .map(|t| expect_uint(t).map(|v| v.low_u32()))
            .collect::<Result<Vec<_>, _>>()?;
        let confidences_bp = unwrap_array(&tokens[3])?
            .iter()
            .map(|t| expect_uint(t).map(|v| v.low_u32() as u16))
            .collect::<Result<Vec<_>, _>>()?;

        return Ok(OracleCall::BatchUpdate {
            assets,
            scores_fp,
            sample_sizes,
            confidences_bp,
        });
    }

    if selector == id(GET_SIG).as_slice() {
        let tokens = decode(&[ParamType::Address], payload)
            .map_err(|e| AbiError::Decode(e.to_string()))?;
        return Ok(OracleCall::Get {
            asset: expect_address(&tokens[0])?,
        });
    }

    Err(AbiError::UnknownSelector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SCORE_SCALE;

    #[test]
    fn test_int128_roundtrip() {
        for value in [
            0i128,
            1,
            -1,
            SCORE_SCALE,
            -SCORE_SCALE,
            i128::MAX,
            i128::MIN,
            42_424_242,
            -200_000_000_000_000_000,
        ] {
            assert_eq!(u256_to_int128(int128_to_u256(value)).unwrap(), value);
        }
    }

    #[test]
    fn test_int128_overflow_detected() {
        // A 256-bit value that is not a sign-extended int128.
        let too_big = U256::from(u128::MAX);
        assert!(u256_to_int128(too_big).is_err());
    }

    #[test]
    fn test_negative_encoding_is_twos_complement() {
        let encoded = int128_to_u256(-1);
        assert_eq!(encoded, U256::MAX);
    }

    #[test]
    fn test_update_roundtrip() {
        let asset = Address::repeat_byte(0xaa);
        let data = encode_update(asset, -SCORE_SCALE, 10, 3124);
        let call = decode_call(&data).unwrap();
        assert_eq!(
            call,
            OracleCall::Update {
                asset,
                score_fp: -SCORE_SCALE,
                sample_size: 10,
                confidence_bp: 3124,
            }
        );
    }

    #[test]
    fn test_batch_roundtrip() {
        let elements = vec![
            (Address::repeat_byte(1), SCORE_SCALE, 1u32, 0u16),
            (Address::repeat_byte(2), -42, 500, 10_000),
        ];
        let data = encode_batch_update(&elements);
        match decode_call(&data).unwrap() {
            OracleCall::BatchUpdate {
                assets,
                scores_fp,
                sample_sizes,
                confidences_bp,
            } => {
                assert_eq!(assets.len(), 2);
                assert_eq!(scores_fp, vec![SCORE_SCALE, -42]);
                assert_eq!(sample_sizes, vec![1, 500]);
                assert_eq!(confidences_bp, vec![0, 10_000]);
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[test]
    fn test_get_and_entry_roundtrip() {
        let asset = Address::repeat_byte(0xbb);
        let data = encode_get(asset);
        assert_eq!(decode_call(&data).unwrap(), OracleCall::Get { asset });

        let entry = OracleEntry {
            score_fp: 600_000_000_000_000_000,
            timestamp: 1_700_000_000,
            sample_size: 10,
            confidence_bp: 3124,
        };
        let decoded = decode_entry(&encode_entry(&entry)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_unknown_selector_rejected() {
        let data = vec![0xde, 0xad, 0xbe, 0xef, 0x00];
        assert!(matches!(
            decode_call(&data),
            Err(AbiError::UnknownSelector)
        ));
    }

    #[test]
    fn test_short_calldata_rejected() {
        assert!(matches!(decode_call(&[0x01]), Err(AbiError::TooShort)));
    }

    #[test]
    fn test_selector_is_first_four_bytes_of_keccak() {
        let data = encode_update(Address::zero(), 0, 1, 0);
        assert_eq!(&data[..4], id(UPDATE_SIG).as_slice());
    }
}
