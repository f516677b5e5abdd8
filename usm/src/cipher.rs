//! Two-key stream cipher (component C3): derives a video-payload XOR mask and
//! an HCA audio key pair from a single 64-bit master key.

/// Bytes of a payload before this offset are never masked (bitstream
/// startcode / codec header safety).
const UNMASKED_PREFIX: usize = 64;

/// Byte-offset shift schedule used to spread a short key across a longer
/// table: repetition `r` of the key is rotated left by `SCHEDULE[r % 6]`.
const SCHEDULE: [usize; 6] = [0, 3, 1, 4, 2, 5];

fn rotated_table(seed: [u8; 8]) -> [u8; 32] {
    let mut table = [0u8; 32];
    for (i, slot) in table.iter_mut().enumerate() {
        let block = i / 8;
        let pos = i % 8;
        let shift = SCHEDULE[block % SCHEDULE.len()];
        *slot = seed[(pos + shift) % 8];
    }
    table
}

fn urus_constant() -> [u8; 8] {
    // "URUC" repeated to fill the 8-byte seed the rotation primitive expects.
    let s = b"URUC";
    [s[0], s[1], s[2], s[3], s[0], s[1], s[2], s[3]]
}

/// Derived key material for one [`crate::container::UsmContainer`]. Built
/// once from the 64-bit master key and owned by the container rather than
/// cached process-wide, so two containers with different keys never interfere.
#[derive(Clone)]
pub struct Cipher {
    mask_even: [u8; 32],
    mask_odd: [u8; 32],
    pub a_key: u8,
    pub b_key: u8,
}

impl Cipher {
    pub fn new(key: u64) -> Self {
        let k = key.to_be_bytes();
        let t1 = rotated_table(k);
        let base = rotated_table(urus_constant());
        let mut t2 = [0u8; 32];
        for i in 0..32 {
            t2[i] = t1[i] ^ base[i];
        }

        let mut mask_odd = t2;
        mask_odd.reverse();

        let k1 = u32::from_be_bytes([k[4], k[5], k[6], k[7]]); // low32(K)
        let k2 = u32::from_be_bytes([k[0], k[1], k[2], k[3]]); // high32(K)
        let a_key = rotated_table(widen(k2))[0];
        let b_key = rotated_table(widen(k1))[0];

        Cipher {
            mask_even: t2,
            mask_odd,
            a_key,
            b_key,
        }
    }

    /// XORs `payload` in place with the video mask. Skips the first
    /// [`UNMASKED_PREFIX`] bytes. An involution: calling this twice with the
    /// same cipher restores the original bytes.
    pub fn apply_video_mask(&self, payload: &mut [u8]) {
        if payload.len() <= UNMASKED_PREFIX {
            return;
        }
        for (i, byte) in payload[UNMASKED_PREFIX..].iter_mut().enumerate() {
            let frame_pos = i % 32;
            let mask = if frame_pos % 2 == 0 {
                self.mask_even[frame_pos]
            } else {
                self.mask_odd[frame_pos]
            };
            *byte ^= mask;
        }
    }

    /// Masking is an involution, so reverting is the same operation as applying.
    pub fn revert_video_mask(&self, payload: &mut [u8]) {
        self.apply_video_mask(payload);
    }
}

fn widen(v: u32) -> [u8; 8] {
    let b = v.to_be_bytes();
    [b[0], b[1], b[2], b[3], b[0], b[1], b[2], b[3]]
}
