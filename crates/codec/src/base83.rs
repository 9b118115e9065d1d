//! Base-83 integer packing used by blur-hash strings.

const ALPHABET: &[u8; 83] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz#$%*+,-.:;=?@[]^_{|}~";

/// Append `value` to `out` as exactly `length` base-83 digits, most significant first.
pub fn encode_into(value: u32, length: u32, out: &mut String) {
    for i in 1..=length {
        let digit = (value / 83u32.pow(length - i)) % 83;
        out.push(ALPHABET[digit as usize] as char);
    }
}

pub fn encode(value: u32, length: u32) -> String {
    let mut out = String::with_capacity(length as usize);
    encode_into(value, length, &mut out);
    out
}

/// Decode a run of base-83 digits.
///
/// Returns `None` if any character is outside the alphabet.
pub fn decode(digits: &str) -> Option<u32> {
    digits.bytes().try_fold(0u32, |acc, byte| {
        let digit = ALPHABET.iter().position(|&c| c == byte)? as u32;
        acc.checked_mul(83)?.checked_add(digit)
    })
}
