//! Hex snapshots of commands, completions and ring memory

use std::io;

/// Writes `bytes` as one little endian dword per line, prefixed by `label`.
///
/// A trailing partial dword is zero extended.
pub fn write_dwords(sink: &mut impl io::Write, label: &str, bytes: &[u8]) -> io::Result<()> {
    writeln!(sink, "{label}: {} bytes", bytes.len())?;
    for (index, chunk) in bytes.chunks(4).enumerate() {
        let mut dword = [0; 4];
        dword[..chunk.len()].copy_from_slice(chunk);
        writeln!(sink, "  dw{index:02}: {:#010x}", u32::from_le_bytes(dword))?;
    }
    Ok(())
}

/// Writes the slots of a ring, one block per slot
pub fn write_slots(
    sink: &mut impl io::Write,
    label: &str,
    memory: &[u8],
    entry_size: usize,
) -> io::Result<()> {
    for (slot, entry) in memory.chunks(entry_size).enumerate() {
        write_dwords(sink, &format!("{label}[{slot}]"), entry)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dword_lines() {
        let mut out = Vec::new();
        write_dwords(&mut out, "x", &[1, 0, 0, 0, 0xff, 0xee]).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(
            out,
            "x: 6 bytes\n  dw00: 0x00000001\n  dw01: 0x0000eeff\n"
        );
    }

    #[test]
    fn slot_blocks() {
        let mut out = Vec::new();
        write_slots(&mut out, "ring", &[0; 8], 4).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("ring[0]: 4 bytes"));
        assert!(out.contains("ring[1]: 4 bytes"));
    }
}
