//! Minimal single-block DES-ECB encryption, used only to derive the LM/NT
//! responses of the classic NTLMv1 handshake (§4.4 "NTLM").
//!
//! NTLMv1 splits a 21-byte hash into three 7-byte DES keys and encrypts the
//! server's 8-byte challenge with each, concatenating the three 8-byte outputs
//! into the 24-byte response. No other part of the crate uses DES; it is not a
//! general-purpose cipher implementation.

#[rustfmt::skip]
const IP: [u8; 64] = [
    58, 50, 42, 34, 26, 18, 10, 2, 60, 52, 44, 36, 28, 20, 12, 4,
    62, 54, 46, 38, 30, 22, 14, 6, 64, 56, 48, 40, 32, 24, 16, 8,
    57, 49, 41, 33, 25, 17, 9, 1, 59, 51, 43, 35, 27, 19, 11, 3,
    61, 53, 45, 37, 29, 21, 13, 5, 63, 55, 47, 39, 31, 23, 15, 7,
];

#[rustfmt::skip]
const FP: [u8; 64] = [
    40, 8, 48, 16, 56, 24, 64, 32, 39, 7, 47, 15, 55, 23, 63, 31,
    38, 6, 46, 14, 54, 22, 62, 30, 37, 5, 45, 13, 53, 21, 61, 29,
    36, 4, 44, 12, 52, 20, 60, 28, 35, 3, 43, 11, 51, 19, 59, 27,
    34, 2, 42, 10, 50, 18, 58, 26, 33, 1, 41, 9, 49, 17, 57, 25,
];

#[rustfmt::skip]
const E: [u8; 48] = [
    32, 1, 2, 3, 4, 5, 4, 5, 6, 7, 8, 9,
    8, 9, 10, 11, 12, 13, 12, 13, 14, 15, 16, 17,
    16, 17, 18, 19, 20, 21, 20, 21, 22, 23, 24, 25,
    24, 25, 26, 27, 28, 29, 28, 29, 30, 31, 32, 1,
];

#[rustfmt::skip]
const P: [u8; 32] = [
    16, 7, 20, 21, 29, 12, 28, 17, 1, 15, 23, 26, 5, 18, 31, 10,
    2, 8, 24, 14, 32, 27, 3, 9, 19, 13, 30, 6, 22, 11, 4, 25,
];

#[rustfmt::skip]
const PC1: [u8; 56] = [
    57, 49, 41, 33, 25, 17, 9, 1, 58, 50, 42, 34, 26, 18,
    10, 2, 59, 51, 43, 35, 27, 19, 11, 3, 60, 52, 44, 36,
    63, 55, 47, 39, 31, 23, 15, 7, 62, 54, 46, 38, 30, 22,
    14, 6, 61, 53, 45, 37, 29, 21, 13, 5, 28, 20, 12, 4,
];

#[rustfmt::skip]
const PC2: [u8; 48] = [
    14, 17, 11, 24, 1, 5, 3, 28, 15, 6, 21, 10,
    23, 19, 12, 4, 26, 8, 16, 7, 27, 20, 13, 2,
    41, 52, 31, 37, 47, 55, 30, 40, 51, 45, 33, 48,
    44, 49, 39, 56, 34, 53, 46, 42, 50, 36, 29, 32,
];

const SHIFTS: [u8; 16] = [1, 1, 2, 2, 2, 2, 2, 2, 1, 2, 2, 2, 2, 2, 2, 1];

#[rustfmt::skip]
const S: [[u8; 64]; 8] = [
    [14,4,13,1,2,15,11,8,3,10,6,12,5,9,0,7, 0,15,7,4,14,2,13,1,10,6,12,11,9,5,3,8,
     4,1,14,8,13,6,2,11,15,12,9,7,3,10,5,0, 15,12,8,2,4,9,1,7,5,11,3,14,10,0,6,13],
    [15,1,8,14,6,11,3,4,9,7,2,13,12,0,5,10, 3,13,4,7,15,2,8,14,12,0,1,10,6,9,11,5,
     0,14,7,11,10,4,13,1,5,8,12,6,9,3,2,15, 13,8,10,1,3,15,4,2,11,6,7,12,0,5,14,9],
    [10,0,9,14,6,3,15,5,1,13,12,7,11,4,2,8, 13,7,0,9,3,4,6,10,2,8,5,14,12,11,15,1,
     13,6,4,9,8,15,3,0,11,1,2,12,5,10,14,7, 1,10,13,0,6,9,8,7,4,15,14,3,11,5,2,12],
    [7,13,14,3,0,6,9,10,1,2,8,5,11,12,4,15, 13,8,11,5,6,15,0,3,4,7,2,12,1,10,14,9,
     10,6,9,0,12,11,7,13,15,1,3,14,5,2,8,4, 3,15,0,6,10,1,13,8,9,4,5,11,12,7,2,14],
    [2,12,4,1,7,10,11,6,8,5,3,15,13,0,14,9, 14,11,2,12,4,7,13,1,5,0,15,10,3,9,8,6,
     4,2,1,11,10,13,7,8,15,9,12,5,6,3,0,14, 11,8,12,7,1,14,2,13,6,15,0,9,10,4,5,3],
    [12,1,10,15,9,2,6,8,0,13,3,4,14,7,5,11, 10,15,4,2,7,12,9,5,6,1,13,14,0,11,3,8,
     9,14,15,5,2,8,12,3,7,0,4,10,1,13,11,6, 4,3,2,12,9,5,15,10,11,14,1,7,6,0,8,13],
    [4,11,2,14,15,0,8,13,3,12,9,7,5,10,6,1, 13,0,11,7,4,9,1,10,14,3,5,12,2,15,8,6,
     1,4,11,13,12,3,7,14,10,15,6,8,0,5,9,2, 6,11,13,8,1,4,10,7,9,5,0,15,14,2,3,12],
    [13,2,8,4,6,15,11,1,10,9,3,14,5,0,12,7, 1,15,13,8,10,3,7,4,12,5,6,11,0,14,9,2,
     7,11,4,1,9,12,14,2,0,6,10,13,15,3,5,8, 2,1,14,7,4,10,8,13,15,12,9,0,3,5,6,11],
];

fn permute(input: u64, bits: usize, table: &[u8]) -> u64 {
    let mut out = 0u64;
    for &bit in table {
        out <<= 1;
        out |= (input >> (bits - bit as usize)) & 1;
    }
    out
}

fn generate_subkeys(key: &[u8; 8]) -> [u64; 16] {
    let key_bits = u64::from_be_bytes(*key);
    let mut combined = permute(key_bits, 64, &PC1);
    let mut c = (combined >> 28) & 0x0FFF_FFFF;
    let mut d = combined & 0x0FFF_FFFF;
    let mut subkeys = [0u64; 16];
    for (round, shift) in SHIFTS.iter().enumerate() {
        c = ((c << shift) | (c >> (28 - shift))) & 0x0FFF_FFFF;
        d = ((d << shift) | (d >> (28 - shift))) & 0x0FFF_FFFF;
        combined = (c << 28) | d;
        subkeys[round] = permute(combined, 56, &PC2);
    }
    subkeys
}

fn feistel(r: u32, subkey: u64) -> u32 {
    let expanded = permute(u64::from(r), 32, &E);
    let xored = expanded ^ subkey;
    let mut output = 0u32;
    for i in 0..8 {
        let chunk = ((xored >> (42 - i * 6)) & 0x3F) as usize;
        let row = ((chunk & 0x20) >> 4) | (chunk & 0x01);
        let col = (chunk >> 1) & 0x0F;
        let val = S[i][row * 16 + col];
        output = (output << 4) | u32::from(val);
    }
    permute(u64::from(output), 32, &P) as u32
}

/// Encrypts one 8-byte block with a 7-byte (56-bit, odd-parity-expanded) DES key.
#[must_use]
pub fn des_encrypt_block(key7: &[u8; 7], block: &[u8; 8]) -> [u8; 8] {
    let key8 = expand_des_key(key7);
    let subkeys = generate_subkeys(&key8);
    let permuted = permute(u64::from_be_bytes(*block), 64, &IP);
    let mut l = ((permuted >> 32) & 0xFFFF_FFFF) as u32;
    let mut r = (permuted & 0xFFFF_FFFF) as u32;
    for subkey in subkeys {
        let new_r = l ^ feistel(r, subkey);
        l = r;
        r = new_r;
    }
    let combined = (u64::from(r) << 32) | u64::from(l);
    let output = permute(combined, 64, &FP);
    output.to_be_bytes()
}

/// Expands a 7-byte NTLM partial key into the 8-byte form DES expects (one
/// (unchecked) parity bit inserted every 7 bits), per MS-NLMP 3.3.1.
fn expand_des_key(key7: &[u8; 7]) -> [u8; 8] {
    let mut bits = 0u64;
    for &b in key7 {
        bits = (bits << 8) | u64::from(b);
    }
    let mut out = [0u8; 8];
    for (i, byte) in out.iter_mut().enumerate() {
        let shift = 49 - i * 7;
        let seven = ((bits >> shift) & 0x7F) as u8;
        *byte = seven << 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn des_is_self_consistent_round_trip_via_known_vector() {
        // FIPS 46-3 test vector: key=0x133457799BBCDFF1, plaintext=0x0123456789ABCDEF
        // DES (not NTLM's truncated key) -> ciphertext 0x85E813540F0AB405
        let key8: [u8; 8] = [0x13, 0x34, 0x57, 0x79, 0x9B, 0xBC, 0xDF, 0xF1];
        let subkeys = generate_subkeys(&key8);
        let block = 0x0123_4567_89AB_CDEFu64.to_be_bytes();
        let permuted = permute(u64::from_be_bytes(block), 64, &IP);
        let mut l = ((permuted >> 32) & 0xFFFF_FFFF) as u32;
        let mut r = (permuted & 0xFFFF_FFFF) as u32;
        for subkey in subkeys {
            let new_r = l ^ feistel(r, subkey);
            l = r;
            r = new_r;
        }
        let combined = (u64::from(r) << 32) | u64::from(l);
        let output = permute(combined, 64, &FP);
        assert_eq!(output, 0x85E8_1354_0F0A_B405);
    }

    #[test]
    fn expand_des_key_sets_low_bit_per_byte() {
        let key7 = [0xFFu8; 7];
        let key8 = expand_des_key(&key7);
        for b in key8 {
            assert_eq!(b & 0x01, 0);
        }
    }
}
