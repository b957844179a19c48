//! The CBOR metadata trailer appended to deploy bytecode.
//!
//! Layout: `CBOR([runtime_length, [data_section_lengths...],
//! immutables_length, {"vyper": [major, minor, patch]}])` followed by the
//! big-endian `u16` length of the CBOR blob itself. The map key is a wire
//! constant; downstream verifiers key on it.

const MAJOR_UINT: u8 = 0x00;
const MAJOR_TEXT: u8 = 0x60;
const MAJOR_ARRAY: u8 = 0x80;
const MAJOR_MAP: u8 = 0xA0;

fn write_head(out: &mut Vec<u8>, major: u8, value: u64) {
    match value {
        0..=23 => out.push(major | value as u8),
        24..=0xFF => {
            out.push(major | 24);
            out.push(value as u8);
        }
        0x100..=0xFFFF => {
            out.push(major | 25);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(major | 26);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(major | 27);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn write_uint(out: &mut Vec<u8>, value: u64) {
    write_head(out, MAJOR_UINT, value);
}

fn write_text(out: &mut Vec<u8>, s: &str) {
    write_head(out, MAJOR_TEXT, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Encode the metadata trailer for a deploy program.
pub fn metadata_trailer(
    runtime_length: usize,
    data_section_lengths: &[usize],
    immutables_length: usize,
    compiler_version: (u64, u64, u64),
) -> Vec<u8> {
    let mut cbor = Vec::with_capacity(32);

    write_head(&mut cbor, MAJOR_ARRAY, 4);
    write_uint(&mut cbor, runtime_length as u64);

    write_head(&mut cbor, MAJOR_ARRAY, data_section_lengths.len() as u64);
    for &len in data_section_lengths {
        write_uint(&mut cbor, len as u64);
    }

    write_uint(&mut cbor, immutables_length as u64);

    write_head(&mut cbor, MAJOR_MAP, 1);
    write_text(&mut cbor, "vyper");
    write_head(&mut cbor, MAJOR_ARRAY, 3);
    write_uint(&mut cbor, compiler_version.0);
    write_uint(&mut cbor, compiler_version.1);
    write_uint(&mut cbor, compiler_version.2);

    let len = u16::try_from(cbor.len()).expect("metadata trailer fits u16");
    cbor.extend_from_slice(&len.to_be_bytes());
    cbor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_encoding_is_bit_exact() {
        let trailer = metadata_trailer(0x2a, &[], 0, (0, 4, 0));
        let expected: Vec<u8> = vec![
            0x84, // array(4)
            0x18, 0x2a, // 42
            0x80, // array(0)
            0x00, // 0
            0xA1, // map(1)
            0x65, b'v', b'y', b'p', b'e', b'r', // "vyper"
            0x83, 0x00, 0x04, 0x00, // [0, 4, 0]
            0x00, 0x10, // length suffix: 16 bytes of CBOR
        ];
        assert_eq!(trailer, expected);
    }

    #[test]
    fn data_section_lengths_are_listed_in_order() {
        let trailer = metadata_trailer(300, &[7, 1000], 24, (0, 4, 0));
        // array(4), uint16 300, array(2), 7, uint16 1000, 24 (one byte head)
        assert_eq!(&trailer[..2], &[0x84, 0x19]);
        assert_eq!(&trailer[2..4], &300u16.to_be_bytes());
        assert_eq!(trailer[4], 0x82);
        assert_eq!(trailer[5], 0x07);
        assert_eq!(trailer[6], 0x19);
        assert_eq!(&trailer[7..9], &1000u16.to_be_bytes());
        assert_eq!(trailer[9], 0x18);
        assert_eq!(trailer[10], 24);
    }

    #[test]
    fn length_suffix_matches_blob() {
        let trailer = metadata_trailer(1, &[2, 3, 4], 5, (9, 9, 9));
        let n = trailer.len();
        let suffix = u16::from_be_bytes([trailer[n - 2], trailer[n - 1]]);
        assert_eq!(suffix as usize, n - 2);
    }
}
