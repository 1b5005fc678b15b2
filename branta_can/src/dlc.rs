//! Conversions between frame payload sizes and CAN data length codes
//!
//! CAN FD frames can only hold the payload sizes enumerated in
//! [`DLC_TO_LENGTH`]. These tables are the only place in this crate where
//! sizes and DLC values are converted.

/// The frame payload size for each DLC value
pub const DLC_TO_LENGTH: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// The smallest DLC whose payload size can hold each number of bytes
pub const LENGTH_TO_DLC: [u8; 65] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, // 0-8
    9, 9, 9, 9, // 9-12
    10, 10, 10, 10, // 13-16
    11, 11, 11, 11, // 17-20
    12, 12, 12, 12, // 21-24
    13, 13, 13, 13, 13, 13, 13, 13, // 25-32
    14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, // 33-48
    15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, // 49-64
];

/// Rounds a frame payload size up to the nearest size that a DLC can represent
///
/// # Panics
///
/// `bytes` must not be greater than 64.
pub fn round_up_frame_payload(bytes: usize) -> usize {
    usize::from(DLC_TO_LENGTH[usize::from(LENGTH_TO_DLC[bytes])])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tables_are_consistent() {
        for bytes in 0..=64 {
            let rounded = round_up_frame_payload(bytes);
            assert!(rounded >= bytes);
            // The rounded size is expressible exactly
            assert_eq!(round_up_frame_payload(rounded), rounded);
        }
        for dlc in 0..16 {
            let length = usize::from(DLC_TO_LENGTH[dlc]);
            assert_eq!(usize::from(LENGTH_TO_DLC[length]), dlc);
        }
    }

    #[test]
    fn round_up_values() {
        assert_eq!(round_up_frame_payload(0), 0);
        assert_eq!(round_up_frame_payload(7), 7);
        assert_eq!(round_up_frame_payload(8), 8);
        assert_eq!(round_up_frame_payload(9), 12);
        assert_eq!(round_up_frame_payload(13), 16);
        assert_eq!(round_up_frame_payload(21), 24);
        assert_eq!(round_up_frame_payload(25), 32);
        assert_eq!(round_up_frame_payload(33), 48);
        assert_eq!(round_up_frame_payload(49), 64);
        assert_eq!(round_up_frame_payload(64), 64);
    }
}
