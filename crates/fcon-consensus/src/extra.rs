// This file is part of the FCon finality layer.

//! C1: the extra-data codec. Encodes/decodes the structured payload that
//! lives after the 32-byte vanity prefix of a header's `extra` field.

use fcon_types::{Address, Hash, Header};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::error::{Error, Result};

/// The decoded contents of a header's `extra` field, after the vanity
/// prefix. `evil_header` is embedded at the outer level as an opaque
/// byte-string (its own RLP encoding) rather than a nested structured type,
/// so the encoder never has to solve the cyclic header-within-header
/// problem; it is decoded lazily, only when non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtraPayload {
    /// 65-byte seal signature, empty before sealing.
    pub seal: Vec<u8>,
    /// Hash of the A-chain block packed by this F-chain block.
    pub current_block: Hash,
    /// Height of that A-chain block.
    pub current_height: u64,
    /// The A-chain header that triggered a replay divergence, if any.
    pub evil_header: Option<Header>,
    /// Signer roster, non-empty only on epoch-boundary headers.
    pub signers: Vec<Address>,
}

impl Encodable for ExtraPayload {
    fn rlp_append(&self, s: &mut RlpStream) {
        let evil_header_bytes: Vec<u8> = match &self.evil_header {
            Some(header) => rlp::encode(header),
            None => Vec::new(),
        };
        s.begin_list(5);
        s.append(&self.seal);
        s.append(&self.current_block);
        s.append(&self.current_height);
        s.append(&evil_header_bytes);
        s.begin_list(self.signers.len());
        for signer in &self.signers {
            s.append(signer);
        }
    }
}

impl Decodable for ExtraPayload {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        if rlp.item_count()? != 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let evil_header_bytes: Vec<u8> = rlp.val_at(3)?;
        let evil_header = if evil_header_bytes.is_empty() {
            None
        } else {
            Some(rlp::decode(&evil_header_bytes)?)
        };
        Ok(ExtraPayload {
            seal: rlp.val_at(0)?,
            current_block: rlp.val_at(1)?,
            current_height: rlp.val_at(2)?,
            evil_header,
            signers: rlp.list_at(4)?,
        })
    }
}

/// Encode `payload` behind a (zero-padded) `vanity_len`-byte vanity prefix,
/// producing a full `header.extra` value.
pub fn encode(vanity: &[u8], vanity_len: usize, payload: &ExtraPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(vanity_len + 128);
    out.extend_from_slice(vanity);
    out.resize(vanity_len, 0);
    out.extend_from_slice(&rlp::encode(payload));
    out
}

/// Decode a full `header.extra` value (vanity prefix + structured payload).
pub fn decode(extra: &[u8], vanity_len: usize) -> Result<ExtraPayload> {
    if extra.len() < vanity_len {
        return Err(Error::InvalidExtra);
    }
    rlp::decode(&extra[vanity_len..]).map_err(|_| Error::InvalidExtra)
}

/// Decode the extra payload of `header`, per C1's `extract` contract.
pub fn extract(header: &Header, vanity_len: usize) -> Result<ExtraPayload> {
    if header.extra.len() < vanity_len {
        return Err(Error::InvalidExtra);
    }
    decode(&header.extra, vanity_len)
}

/// Read the genesis F-chain header's special extra layout:
/// `vanity(vanity_len) || signer_address(20) || zero_pad(...) || signature(65)`.
/// Used only to bootstrap the very first snapshot.
pub fn genesis_signer(extra: &[u8], vanity_len: usize) -> Result<Address> {
    let end = vanity_len
        .checked_add(20)
        .ok_or(Error::InvalidExtra)?;
    if extra.len() < end {
        return Err(Error::InvalidExtra);
    }
    Ok(Address::from_slice(&extra[vanity_len..end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcon_types::Hash as FHash;

    fn sample_payload() -> ExtraPayload {
        ExtraPayload {
            seal: vec![0u8; 65],
            current_block: FHash::from_low_u64_be(11),
            current_height: 11,
            evil_header: None,
            signers: vec![Address::from_low_u64_be(1), Address::from_low_u64_be(2)],
        }
    }

    #[test]
    fn round_trips_without_evil_header() {
        let payload = sample_payload();
        let extra = encode(b"vanity", 32, &payload);
        let decoded = decode(&extra, 32).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn round_trips_with_evil_header() {
        let mut payload = sample_payload();
        payload.evil_header = Some(Header {
            number: 12,
            ..Default::default()
        });
        let extra = encode(b"vanity", 32, &payload);
        let decoded = decode(&extra, 32).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn decode_rejects_short_extra() {
        let err = decode(&[0u8; 10], 32).unwrap_err();
        assert_eq!(err, Error::InvalidExtra);
    }

    #[test]
    fn extract_rejects_header_missing_vanity() {
        let header = Header {
            extra: vec![1, 2, 3],
            ..Default::default()
        };
        let err = extract(&header, 32).unwrap_err();
        assert_eq!(err, Error::InvalidExtra);
    }

    #[test]
    fn genesis_signer_reads_fixed_offset() {
        let addr = Address::from_low_u64_be(0xabcd);
        let mut extra = vec![0u8; 32];
        extra.extend_from_slice(addr.as_bytes());
        extra.extend_from_slice(&[0u8; 65]);
        assert_eq!(genesis_signer(&extra, 32).unwrap(), addr);
    }
}
