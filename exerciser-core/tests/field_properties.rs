use exerciser_core::generic_command::{CommandBuffer, DataDirection};
use proptest::prelude::*;

const DWORDS: usize = 16;

/// A 64 byte command filled with `background`
fn command(background: u32) -> CommandBuffer {
    let mut command = CommandBuffer::new(DWORDS * 4, DataDirection::None).unwrap();
    for index in 0..DWORDS {
        command.set_dword(index, background).unwrap();
    }
    command
}

/// Every dword except `index` still holds `background`
fn others_unchanged(command: &CommandBuffer, index: usize, background: u32) -> bool {
    (0..DWORDS)
        .filter(|i| *i != index)
        .all(|i| command.get_dword(i).unwrap() == background)
}

proptest! {
    #[test]
    fn dword_round_trip(index in 0..DWORDS, value: u32, background: u32) {
        let mut command = command(background);
        command.set_dword(index, value).unwrap();
        prop_assert_eq!(command.get_dword(index).unwrap(), value);
        prop_assert!(others_unchanged(&command, index, background));
    }

    #[test]
    fn word_round_trip(index in 0..DWORDS, offset in 0u8..2, value: u16, background: u32) {
        let mut command = command(background);
        command.set_word(index, offset, value).unwrap();
        prop_assert_eq!(command.get_word(index, offset).unwrap(), value);

        let shift = offset as u32 * 16;
        let mask = 0xffffu32 << shift;
        let expected = (background & !mask) | ((value as u32) << shift);
        prop_assert_eq!(command.get_dword(index).unwrap(), expected);
        prop_assert!(others_unchanged(&command, index, background));
    }

    #[test]
    fn byte_round_trip(index in 0..DWORDS, offset in 0u8..4, value: u8, background: u32) {
        let mut command = command(background);
        command.set_byte(index, offset, value).unwrap();
        prop_assert_eq!(command.get_byte(index, offset).unwrap(), value);

        let shift = offset as u32 * 8;
        let mask = 0xffu32 << shift;
        let expected = (background & !mask) | ((value as u32) << shift);
        prop_assert_eq!(command.get_dword(index).unwrap(), expected);
        prop_assert!(others_unchanged(&command, index, background));
    }

    #[test]
    fn bit_round_trip(index in 0..DWORDS, offset in 0u8..32, value: bool, background: u32) {
        let mut command = command(background);
        command.set_bit(index, offset, value).unwrap();
        prop_assert_eq!(command.get_bit(index, offset).unwrap(), value);

        let mask = 1u32 << offset;
        let expected = if value { background | mask } else { background & !mask };
        prop_assert_eq!(command.get_dword(index).unwrap(), expected);
        prop_assert!(others_unchanged(&command, index, background));
    }

    #[test]
    fn out_of_range_index_fails(index in DWORDS..DWORDS + 64, offset in 0u8..32) {
        let mut command = command(0);
        prop_assert!(command.get_dword(index).is_err());
        prop_assert!(command.set_bit(index, offset, true).is_err());
        prop_assert!(others_unchanged(&command, usize::MAX, 0));
    }
}
