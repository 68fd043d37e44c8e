//! Flash CRC as computed by the board bootloader.
//!
//! Reflected CRC-32 (poly 0x04C11DB7) with zero initial value and no final
//! XOR, taken over the whole application flash: image bytes followed by
//! erased (0xFF) bytes up to the flash size.

use crc::{Algorithm, Crc};

pub const BOOTLOADER_CRC32: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04C1_1DB7,
    init: 0x0000_0000,
    refin: true,
    refout: true,
    xorout: 0x0000_0000,
    check: 0x2DFD_2D88,
    residue: 0x0000_0000,
};

const FLASH_CRC: Crc<u32> = Crc::<u32>::new(&BOOTLOADER_CRC32);

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xFF;

/// CRC of `image` padded with erased bytes to `flash_size`.
///
/// An image longer than the flash is hashed as-is; the caller rejects it
/// before programming.
pub fn firmware_crc(image: &[u8], flash_size: u32) -> u32 {
    let mut digest = FLASH_CRC.digest();
    digest.update(image);

    let padding = (flash_size as usize).saturating_sub(image.len());
    let erased = [ERASED; 256];
    let mut left = padding;
    while left > 0 {
        let n = left.min(erased.len());
        digest.update(&erased[..n]);
        left -= n;
    }
    digest.finalize()
}
