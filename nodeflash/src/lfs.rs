//! Rebasing of Lua flash store (LFS) images onto their flash partition.
//!
//! An unrelocated image is a header of two words (signature, byte size), the
//! image body, then one bitmap bit per image word. A set bit marks a word
//! holding a word index into flash that has to become an absolute address.

use crate::image::partition::FLASH_BASE_ADDR;
use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use std::io::Read;

pub const FLASH_SIG: u32 = 0xfafa_a150;
pub const FLASH_SIG_MASK: u32 = 0xffff_fff0;
pub const FLASH_SIG_ABSOLUTE: u32 = 0x0000_0001;

const WORD_SIZE: usize = 4;
const WORD_BITS: usize = 32;

/// Inflates a gzip compressed image, refusing anything larger than `limit`.
pub fn decompress(compressed: &[u8], limit: u32) -> Result<Vec<u8>> {
    let mut image = Vec::new();
    GzDecoder::new(compressed)
        .take(limit as u64 + 1)
        .read_to_end(&mut image)?;
    if image.len() > limit as usize {
        return Err(Error::Relocation("image larger than LFS partition"));
    }
    Ok(image)
}

/// Relocates `image` to run from the partition at flash offset `addr`.
///
/// The bitmap is dropped from the output.
pub fn relocate(image: &[u8], addr: u32, partition_size: u32) -> Result<Vec<u8>> {
    if image.len() % WORD_SIZE != 0 || image.len() < 2 * WORD_SIZE {
        return Err(Error::Relocation("image is not a whole number of words"));
    }
    let mut words: Vec<u32> = image
        .chunks_exact(WORD_SIZE)
        .map(LittleEndian::read_u32)
        .collect();

    let (sig, size) = (words[0], words[1]);
    if sig & FLASH_SIG_MASK != FLASH_SIG {
        return Err(Error::Relocation("bad signature"));
    }
    if sig & FLASH_SIG_ABSOLUTE != 0 {
        return Err(Error::Relocation("image is already absolute"));
    }
    if size as usize % WORD_SIZE != 0 {
        return Err(Error::Relocation("size is not word aligned"));
    }
    if size > partition_size {
        return Err(Error::Relocation("image larger than LFS partition"));
    }

    let count = size as usize / WORD_SIZE;
    let flag_words = (count + WORD_BITS - 1) / WORD_BITS;
    if words.len() != count + flag_words {
        return Err(Error::Relocation("length does not match size field"));
    }

    let base = addr.wrapping_add(FLASH_BASE_ADDR);
    let (body, flags) = words.split_at_mut(count);
    for (i, word) in body.iter_mut().enumerate() {
        if flags[i / WORD_BITS] >> (i % WORD_BITS) & 1 == 1 {
            *word = word.wrapping_mul(WORD_SIZE as u32).wrapping_add(base);
        }
    }

    let mut out = vec![0u8; count * WORD_SIZE];
    LittleEndian::write_u32_into(body, &mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn blob(body: &[u32], flags: &[u32]) -> Vec<u8> {
        let size = ((body.len() + 2) * WORD_SIZE) as u32;
        let words: Vec<u32> = [FLASH_SIG, size]
            .iter()
            .chain(body)
            .chain(flags)
            .copied()
            .collect();
        let mut out = vec![0u8; words.len() * WORD_SIZE];
        LittleEndian::write_u32_into(&words, &mut out);
        out
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes.chunks_exact(4).map(LittleEndian::read_u32).collect()
    }

    #[test]
    fn flagged_words_become_absolute() {
        // header words are part of the relocated image, so flag bit 2 is the
        // first body word
        let image = blob(&[0x100, 0x200], &[0b0100]);
        let out = words(&relocate(&image, 0x20000, 0x10000).unwrap());
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], FLASH_SIG);
        assert_eq!(out[2], 0x100 * 4 + 0x4022_0000);
        assert_eq!(out[3], 0x200);
    }

    #[test]
    fn two_word_image_first_word_flagged() {
        let mut image = vec![0u8; 12];
        LittleEndian::write_u32_into(&[FLASH_SIG, 8, 0b01], &mut image);
        let out = words(&relocate(&image, 0x20000, 0x10000).unwrap());
        assert_eq!(
            out,
            vec![FLASH_SIG.wrapping_mul(4).wrapping_add(0x4022_0000), 8]
        );
    }

    #[test]
    fn targets_differ_only_in_flagged_words() {
        let body: Vec<u32> = (0..70).map(|i| i * 3).collect();
        let flags = [0xaaaa_aaaa, 0x0000_ffff, 0x1];
        let image = blob(&body, &flags);

        let a = words(&relocate(&image, 0x20000, 0x10000).unwrap());
        let b = words(&relocate(&image, 0x60000, 0x10000).unwrap());
        for i in 0..a.len() {
            let flagged = flags[i / 32] >> (i % 32) & 1 == 1;
            let diff = b[i].wrapping_sub(a[i]);
            assert_eq!(diff, if flagged { 0x40000 } else { 0 }, "word {}", i);
        }
    }

    #[test]
    fn rejects_malformed_images() {
        let good = blob(&[1, 2, 3], &[0]);

        let mut bad_sig = good.clone();
        bad_sig[1] ^= 0x01;
        assert!(relocate(&bad_sig, 0, 0x10000).is_err());

        let mut absolute = good.clone();
        absolute[0] |= FLASH_SIG_ABSOLUTE as u8;
        assert!(matches!(
            relocate(&absolute, 0, 0x10000),
            Err(Error::Relocation("image is already absolute"))
        ));

        assert!(relocate(&good, 0, 8).is_err());
        assert!(relocate(&good[..good.len() - 4], 0, 0x10000).is_err());
        assert!(relocate(&good[..good.len() - 1], 0, 0x10000).is_err());

        let mut unaligned = good.clone();
        unaligned[4] = 21;
        assert!(relocate(&unaligned, 0, 0x10000).is_err());
    }

    #[test]
    fn decompresses_within_limit() {
        let image = blob(&[1, 2, 3], &[0]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&image).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress(&compressed, 0x1000).unwrap(), image);
        assert!(matches!(
            decompress(&compressed, 8),
            Err(Error::Relocation(_))
        ));
    }
}
