//! Order-preserving integer encoding for node positions.
//!
//! Layout: 4-byte big-endian header `0x80000000 + size` for non-negative
//! values (`0x80000000 - size` for negative ones), followed by `size` bytes of
//! the big-endian magnitude, bit-inverted when negative. Lexicographic byte
//! order of the encodings equals numeric order of the integers, so the
//! backend can range-filter positions with plain BLOB comparisons.

use crate::error::VelesError;
use num_bigint::{BigInt, Sign};

const HEADER_BIAS: u32 = 0x8000_0000;

/// Encode an arbitrary integer.
pub fn encode(value: &BigInt) -> Vec<u8> {
    let (sign, mut magnitude) = value.to_bytes_be();
    if sign == Sign::NoSign {
        magnitude.clear();
    }
    let size = magnitude.len() as u32;
    let mut out = Vec::with_capacity(4 + magnitude.len());
    if sign == Sign::Minus {
        out.extend_from_slice(&(HEADER_BIAS - size).to_be_bytes());
        out.extend(magnitude.iter().map(|b| !b));
    } else {
        out.extend_from_slice(&(HEADER_BIAS + size).to_be_bytes());
        out.extend_from_slice(&magnitude);
    }
    out
}

/// Decode an encoding produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<BigInt, VelesError> {
    if bytes.len() < 4 {
        return Err(VelesError::schema("position encoding shorter than header"));
    }
    let header = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let body = &bytes[4..];
    if header >= HEADER_BIAS {
        let size = (header - HEADER_BIAS) as usize;
        if body.len() != size {
            return Err(VelesError::schema("position encoding length mismatch"));
        }
        Ok(BigInt::from_bytes_be(Sign::Plus, body))
    } else {
        let size = (HEADER_BIAS - header) as usize;
        if body.len() != size {
            return Err(VelesError::schema("position encoding length mismatch"));
        }
        let magnitude: Vec<u8> = body.iter().map(|b| !b).collect();
        Ok(BigInt::from_bytes_be(Sign::Minus, &magnitude))
    }
}

/// Encode an optional position; `None` stays `None` (SQL NULL).
pub fn encode_opt(value: &Option<BigInt>) -> Option<Vec<u8>> {
    value.as_ref().map(encode)
}

pub fn decode_opt(bytes: Option<Vec<u8>>) -> Result<Option<BigInt>, VelesError> {
    bytes.map(|b| decode(&b)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pow2(bits: usize) -> BigInt {
        BigInt::from(1u8) << bits
    }

    #[test]
    fn test_zero_has_empty_body() {
        assert_eq!(encode(&BigInt::from(0)), vec![0x80, 0, 0, 0]);
        assert_eq!(decode(&[0x80, 0, 0, 0]).unwrap(), BigInt::from(0));
    }

    #[test]
    fn test_ordering_examples() {
        let ordered = vec![
            -pow2(800),
            BigInt::from(-256),
            BigInt::from(-2),
            BigInt::from(-1),
            BigInt::from(0),
            BigInt::from(1),
            BigInt::from(2),
            BigInt::from(255),
            BigInt::from(256),
            pow2(800),
        ];
        for pair in ordered.windows(2) {
            assert!(
                encode(&pair[0]) < encode(&pair[1]),
                "{} should encode below {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(decode(&[0x80, 0, 0]).is_err());
        assert!(decode(&[0x80, 0, 0, 2, 1]).is_err());
    }

    fn any_bigint() -> impl Strategy<Value = BigInt> {
        prop_oneof![
            any::<i64>().prop_map(BigInt::from),
            (any::<bool>(), proptest::collection::vec(any::<u8>(), 0..40)).prop_map(
                |(negative, bytes)| {
                    let sign = if negative { Sign::Minus } else { Sign::Plus };
                    BigInt::from_bytes_be(sign, &bytes)
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn prop_order_is_preserved(a in any_bigint(), b in any_bigint()) {
            prop_assert_eq!(a.cmp(&b), encode(&a).cmp(&encode(&b)));
        }

        #[test]
        fn prop_decode_inverts_encode(a in any_bigint()) {
            prop_assert_eq!(decode(&encode(&a)).unwrap(), a);
        }
    }
}
