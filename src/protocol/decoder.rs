//! Extraction of bit and word lists from read-reply PDUs.
//!
//! A response PDU only carries a byte count, so both extractors take the item
//! count cached on the originating telegram. They return `None` on any layout
//! inconsistency; the caller logs and falls back to the raw completion event.

/// Decode a read-bits PDU (`[byte_count][bits, LSB first]`, fc 1/2) into at
/// most `count` booleans in wire order.
pub fn decode_bit_values(pdu: &[u8], count: u16) -> Option<Vec<bool>> {
    let byte_count = *pdu.first()? as usize;
    if pdu.len() != byte_count + 1 {
        return None;
    }

    let mut values = Vec::with_capacity(count as usize);
    'bits: for byte in &pdu[1..] {
        for bit in 0..8 {
            if values.len() == count as usize {
                break 'bits;
            }
            values.push(byte & (1 << bit) != 0);
        }
    }
    Some(values)
}

/// Decode a read-words PDU (`[byte_count][N big-endian words]`, fc 3/4) into
/// exactly `count` registers.
pub fn decode_word_values(pdu: &[u8], count: u16) -> Option<Vec<u16>> {
    let byte_count = *pdu.first()? as usize;
    if pdu.len() != byte_count + 1 {
        return None;
    }
    if pdu.len() != count as usize * 2 + 1 {
        return None;
    }

    let values = pdu[1..]
        .chunks_exact(2)
        .map(|word| u16::from_be_bytes([word[0], word[1]]))
        .collect();
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_decode_big_endian() {
        assert_eq!(
            decode_word_values(&[0x04, 0x00, 0x0A, 0x00, 0x14], 2),
            Some(vec![10, 20])
        );
    }

    #[test]
    fn words_reject_byte_count_mismatch() {
        // byte count says 4, but only one word follows
        assert_eq!(decode_word_values(&[0x04, 0x00, 0x0A], 2), None);
        // consistent layout, but not what was requested
        assert_eq!(decode_word_values(&[0x02, 0x00, 0x0A], 2), None);
        assert_eq!(decode_word_values(&[], 1), None);
    }

    #[test]
    fn bits_decode_lsb_first() {
        // 0xCD = 1100_1101 -> coils 1,0,1,1,0,0,1,1 in wire order
        assert_eq!(
            decode_bit_values(&[0x01, 0xCD], 8),
            Some(vec![true, false, true, true, false, false, true, true])
        );
    }

    #[test]
    fn bits_stop_at_requested_count() {
        let values = decode_bit_values(&[0x02, 0xFF, 0x03], 10).unwrap();
        assert_eq!(values.len(), 10);
        assert_eq!(&values[8..], &[true, true]);
    }

    #[test]
    fn bits_reject_byte_count_mismatch() {
        assert_eq!(decode_bit_values(&[0x02, 0xFF], 10), None);
        assert_eq!(decode_bit_values(&[], 1), None);
    }
}
