//! On-wire framing: `seqnum_le_u32 ‖ encoded_bytes`, no length prefix — the
//! datagram length *is* the payload length.

use bytes::{BufMut, BytesMut};

/// Length of the sequence-number header, in bytes.
pub const HEADER_LEN: usize = 4;

/// Serialize `(seq, payload)` into a datagram ready for `Transport::send_frame`.
pub fn encode(seq: u32, payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32_le(seq);
    out.extend_from_slice(payload);
    out
}

/// Parse a received datagram into `(seq, payload)`. Returns `None` if the
/// datagram is shorter than [`HEADER_LEN`] — the caller counts this as
/// malformed and discards it.
pub fn decode(datagram: &[u8]) -> Option<(u32, &[u8])> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let seq = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    Some((seq, &datagram[HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_seq_and_payload() {
        for payload_len in [0usize, 1, 20, 320, 1020] {
            let payload = vec![0xABu8; payload_len];
            for seq in [0u32, 1, 12345, u32::MAX] {
                let datagram = encode(seq, &payload);
                let (got_seq, got_payload) = decode(&datagram).expect("decodes");
                assert_eq!(got_seq, seq);
                assert_eq!(got_payload, payload.as_slice());
            }
        }
    }

    #[test]
    fn sequence_number_is_little_endian_on_the_wire() {
        // 12345 == 0x3039
        let datagram = [0x39, 0x30, 0x00, 0x00];
        let (seq, payload) = decode(&datagram).expect("decodes");
        assert_eq!(seq, 12345);
        assert!(payload.is_empty());
    }

    #[test]
    fn short_datagram_is_malformed() {
        assert!(decode(&[0u8; 3]).is_none());
        assert!(decode(&[]).is_none());
    }
}
