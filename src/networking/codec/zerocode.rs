//! Zero-coding for packet bodies.
//!
//! Runs of 0x00 bytes are collapsed into a marker pair to save bandwidth:
//! - `0x00 0x00` is a single literal zero byte.
//! - `0x00 n` (n >= 2) expands to n zero bytes.
//!
//! Bodies are expanded before any field decoding happens.

use super::CodecError;

/// Encode a body with zero run-length compression.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0 {
            let mut zero_count = 0usize;
            let mut j = i;
            while j < data.len() && data[j] == 0 && zero_count < 255 {
                zero_count += 1;
                j += 1;
            }

            if zero_count == 1 {
                result.push(0x00);
                result.push(0x00);
            } else {
                result.push(0x00);
                result.push(zero_count as u8);
            }

            i = j;
        } else {
            result.push(data[i]);
            i += 1;
        }
    }

    result
}

/// Expand a zero-coded body back to its original bytes.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut result = Vec::with_capacity(data.len() * 2);
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0x00 {
            if i + 1 >= data.len() {
                return Err(CodecError::Truncated);
            }

            let count = data[i + 1];
            if count == 0 {
                result.push(0x00);
            } else {
                result.extend(std::iter::repeat(0x00).take(count as usize));
            }

            i += 2;
        } else {
            result.push(data[i]);
            i += 1;
        }
    }

    Ok(result)
}

/// Whether zero-coding is worth applying: at least 10% smaller.
pub fn should_encode(data: &[u8]) -> bool {
    if data.len() < 16 {
        return false;
    }

    let encoded = encode(data);
    let savings = data.len().saturating_sub(encoded.len());
    (savings * 100) / data.len() >= 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_zero() {
        let data = vec![1, 0, 2];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![1, 0, 0, 2]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_multiple_zeros() {
        let data = vec![1, 0, 0, 0, 2];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![1, 0, 3, 2]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_max_run() {
        let data = vec![0; 255];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![0, 255]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_run_overflow() {
        let data = vec![0; 300];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![0, 255, 0, 45]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_no_zeros() {
        let data = vec![1, 2, 3, 4, 5];
        assert_eq!(encode(&data), data);
        assert_eq!(decode(&data).unwrap(), data);
    }

    #[test]
    fn test_truncated_marker() {
        assert!(matches!(decode(&[1, 2, 0]), Err(CodecError::Truncated)));
    }

    #[test]
    fn test_should_encode_threshold() {
        assert!(!should_encode(&[0; 8]));
        assert!(should_encode(&[0; 64]));
        assert!(!should_encode(&[7u8; 64]));
    }
}
