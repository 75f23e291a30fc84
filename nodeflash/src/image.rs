mod firmware;
pub mod partition;

pub use firmware::{FirmwareImage, FlashFreq, FlashMode, FlashSize, Segment};
pub use partition::{
    layout, resize_page, LayoutOverrides, Partition, PartitionTable, PartitionType, RecordPage,
    SpiffsSize,
};

/// Initial state of the ROM's rolling XOR checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Folds `data` into the checksum `state` the way the ROM does.
pub fn checksum(data: &[u8], state: u8) -> u8 {
    data.iter().fold(state, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_checksum_is_seed() {
        assert_eq!(checksum(&[], CHECKSUM_SEED), 0xEF);
    }

    #[test]
    fn checksum_folds_sequentially() {
        let a = [0x12, 0x34, 0x56];
        let b = [0xff, 0x00, 0x9a, 0x01];
        let joined: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        assert_eq!(
            checksum(&joined, CHECKSUM_SEED),
            checksum(&b, checksum(&a, CHECKSUM_SEED))
        );
    }
}
