//! XOR masking of client payloads.

/// XORs `buf` with the masking key, starting at position 0 of the payload.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    apply_mask_at(buf, key, 0);
}

/// XORs a slice that begins `offset` bytes into a masked payload.
///
/// Byte `i` of a payload is masked with `key[i % 4]`, so a slice received on its own
/// is unmasked with the key rotated by its position in the payload.
#[inline]
pub fn apply_mask_at(buf: &mut [u8], key: [u8; 4], offset: usize) {
    let mut key = key;
    key.rotate_left(offset & 3);

    let word = u32::from_ne_bytes(key);
    let mut blocks = buf.chunks_exact_mut(4);
    for block in &mut blocks {
        if let [a, b, c, d] = block {
            let masked = u32::from_ne_bytes([*a, *b, *c, *d]) ^ word;
            [*a, *b, *c, *d] = masked.to_ne_bytes();
        }
    }
    for (byte, k) in blocks.into_remainder().iter_mut().zip(key) {
        *byte ^= k;
    }
}
