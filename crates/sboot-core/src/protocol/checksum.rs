//! Frame integrity algorithms.

/// 16-bit wrapping byte sum, used by the 32-bit variant.
pub fn additive16<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> u16 {
    parts
        .into_iter()
        .flat_map(|p| p.iter())
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// CRC-32 (IEEE 802.3, reflected), used by the 64-bit variant.
pub fn crc32<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    const POLYNOMIAL: u32 = 0xEDB88320;
    let mut crc = 0xFFFF_FFFFu32;

    for &byte in parts.into_iter().flat_map(|p| p.iter()) {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        // Standard CRC-32 check input.
        assert_eq!(crc32([b"123456789".as_slice()]), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_split_input_matches_whole() {
        let whole = crc32([b"PrObE\0\x01\x00\x00\x00".as_slice()]);
        let split = crc32([b"PrObE\0".as_slice(), &[1, 0, 0, 0]]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_additive16_wraps() {
        let data = vec![0xFFu8; 0x200];
        assert_eq!(additive16([data.as_slice()]), (0xFFu32 * 0x200 % 0x10000) as u16);
        assert_eq!(additive16([&[0x01u8][..], &[0x02, 0x03]]), 6);
    }
}
