//! Six-digit confirmation codes gating pickup and delivery handoffs.
use rand::Rng;

pub const CODE_LEN: usize = 6;

/// Draws a code uniformly from `000000..=999999`.
pub fn generate_code() -> String {
    let n: u32 = rand::rng().random_range(0..1_000_000);
    format!("{n:06}")
}

/// Exactly six ASCII digits.
pub fn validate_format(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_well_formed() {
        for _ in 0..1_000 {
            let code = generate_code();
            assert!(validate_format(&code), "malformed code {code}");
        }
    }

    #[test]
    fn format_rejects_near_misses() {
        assert!(validate_format("000000"));
        assert!(validate_format("123456"));
        assert!(!validate_format("12345"));
        assert!(!validate_format("1234567"));
        assert!(!validate_format("12a456"));
        assert!(!validate_format(" 12345"));
        assert!(!validate_format("１２３４５６"));
    }
}
