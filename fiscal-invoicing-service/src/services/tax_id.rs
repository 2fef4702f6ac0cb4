//! CUIT (national business id) checksum validation.

const WEIGHTS: [u32; 10] = [5, 4, 3, 2, 7, 6, 5, 4, 3, 2];

/// Validate an 11-digit CUIT with its modulus-11 check digit.
///
/// Returns `false` for anything that is not exactly 11 ASCII digits.
pub fn is_valid_cuit(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 11 || !bytes.iter().all(u8::is_ascii_digit) {
        return false;
    }

    let digits: Vec<u32> = bytes.iter().map(|b| u32::from(b - b'0')).collect();
    let sum: u32 = WEIGHTS.iter().zip(&digits).map(|(w, d)| w * d).sum();
    let check = (11 - sum % 11) % 11;

    check == digits[10]
}

/// Keep only ASCII digits (`20-30405060-7` -> `20304050607`).
pub fn digits_only(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_check_digit(first_ten: &str) -> u32 {
        let weights = [5, 4, 3, 2, 7, 6, 5, 4, 3, 2];
        let total: u32 = first_ten
            .chars()
            .zip(weights)
            .map(|(c, w)| c.to_digit(10).unwrap() * w)
            .sum();
        match 11 - total % 11 {
            11 => 0,
            n => n,
        }
    }

    #[test]
    fn accepts_known_valid_ids() {
        assert!(is_valid_cuit("20304050609"));
        assert!(is_valid_cuit("30500010912"));
    }

    #[test]
    fn rejects_bad_check_digit() {
        assert!(!is_valid_cuit("12345678901"));
        assert!(!is_valid_cuit("20304050607"));
    }

    #[test]
    fn agrees_with_reference_checksum() {
        for seed in 0u64..500 {
            let prefix = format!("{:010}", seed.wrapping_mul(7_919_113) % 10_000_000_000);
            let check = reference_check_digit(&prefix);
            if check == 10 {
                assert!(!is_valid_cuit(&format!("{prefix}0")));
                continue;
            }
            for candidate in 0..10 {
                let id = format!("{prefix}{candidate}");
                assert_eq!(is_valid_cuit(&id), candidate == check, "id {id}");
            }
        }
    }

    #[test]
    fn malformed_input_fails_closed() {
        for input in ["", "2030405060", "203040506071", "20-30405060-7", "2030405060a", "٢٠٣٠٤٠٥٠٦٠٧"] {
            assert!(!is_valid_cuit(input), "{input:?}");
        }
    }

    #[test]
    fn digits_only_strips_separators() {
        assert_eq!(digits_only("20-30405060-7"), "20304050607");
        assert_eq!(digits_only(" abc "), "");
    }
}
