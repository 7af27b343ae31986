//! MATLAB Level 5 MAT-file writer, one compressed row vector per variable

use std::io::{self, Write};

use libflate::zlib;

const HEADER_TEXT: &str = "MATLAB 5.0 MAT-file, Platform: posix, Created by: argus";
const VERSION: u16 = 0x0100;

// Data element types
const MI_INT8: u32 = 1;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;

// Array classes
const MX_DOUBLE_CLASS: u32 = 6;
const MX_INT64_CLASS: u32 = 14;

/// A named 1xN row vector
pub enum Variable<'a> {
    Int64(&'a str, &'a [i64]),
    Double(&'a str, &'a [f64]),
}

/// Write a MAT-file holding `variables`, each zlib-compressed.
pub fn write_mat<W: Write>(mut w: W, variables: &[Variable<'_>]) -> io::Result<()> {
    let mut header = [b' '; 128];
    header[..HEADER_TEXT.len()].copy_from_slice(HEADER_TEXT.as_bytes());
    header[116..124].fill(0);
    header[124..126].copy_from_slice(&VERSION.to_le_bytes());
    header[126..128].copy_from_slice(b"IM");
    w.write_all(&header)?;

    for variable in variables {
        let matrix = matrix_element(variable);

        let mut encoder = zlib::Encoder::new(Vec::new())?;
        encoder.write_all(&matrix)?;
        let compressed = encoder.finish().into_result()?;

        w.write_all(&MI_COMPRESSED.to_le_bytes())?;
        w.write_all(&(compressed.len() as u32).to_le_bytes())?;
        w.write_all(&compressed)?;
    }
    w.flush()
}

fn matrix_element(variable: &Variable<'_>) -> Vec<u8> {
    let (name, class, data_type, len, data) = match variable {
        Variable::Int64(name, values) => (
            *name,
            MX_INT64_CLASS,
            MI_INT64,
            values.len(),
            values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>(),
        ),
        Variable::Double(name, values) => (
            *name,
            MX_DOUBLE_CLASS,
            MI_DOUBLE,
            values.len(),
            values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>(),
        ),
    };

    let mut body = Vec::new();

    let mut flags = Vec::with_capacity(8);
    flags.extend_from_slice(&class.to_le_bytes());
    flags.extend_from_slice(&0u32.to_le_bytes());
    push_element(&mut body, MI_UINT32, &flags);

    let mut dims = Vec::with_capacity(8);
    dims.extend_from_slice(&1i32.to_le_bytes());
    dims.extend_from_slice(&(len as i32).to_le_bytes());
    push_element(&mut body, MI_INT32, &dims);

    push_element(&mut body, MI_INT8, name.as_bytes());
    push_element(&mut body, data_type, &data);

    let mut matrix = Vec::with_capacity(body.len() + 8);
    matrix.extend_from_slice(&MI_MATRIX.to_le_bytes());
    matrix.extend_from_slice(&(body.len() as u32).to_le_bytes());
    matrix.extend_from_slice(&body);
    matrix
}

/// Tag, payload, zero padding to an 8-byte boundary
fn push_element(out: &mut Vec<u8>, data_type: u32, payload: &[u8]) {
    out.extend_from_slice(&data_type.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let padding = (8 - payload.len() % 8) % 8;
    out.extend(std::iter::repeat(0u8).take(padding));
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn writes_header_and_compressed_matrices() {
        let mut out = Vec::new();
        write_mat(
            &mut out,
            &[
                Variable::Int64("frameNumber", &[1, 2, 3]),
                Variable::Double("timeStamp", &[0.0, 0.01, 0.02]),
            ],
        )
        .unwrap();

        assert!(out.starts_with(b"MATLAB 5.0 MAT-file"));
        assert_eq!(&out[126..128], b"IM");

        assert_eq!(u32_at(&out, 128), MI_COMPRESSED);
        let size = u32_at(&out, 132) as usize;
        let mut matrix = Vec::new();
        zlib::Decoder::new(&out[136..136 + size])
            .unwrap()
            .read_to_end(&mut matrix)
            .unwrap();

        assert_eq!(u32_at(&matrix, 0), MI_MATRIX);
        assert_eq!(u32_at(&matrix, 4) as usize, matrix.len() - 8);
        // array flags carry the class
        assert_eq!(u32_at(&matrix, 16), MX_INT64_CLASS);
        // 1x3
        assert_eq!(u32_at(&matrix, 32), 1);
        assert_eq!(u32_at(&matrix, 36), 3);
        // name "frameNumber", 11 bytes padded to 16
        assert_eq!(u32_at(&matrix, 44), 11);
        assert_eq!(&matrix[48..59], b"frameNumber");
        assert_eq!(u32_at(&matrix, 64), MI_INT64);
        assert_eq!(u32_at(&matrix, 68), 24);

        // second variable follows the first
        assert_eq!(u32_at(&out, 136 + size), MI_COMPRESSED);
    }

    #[test]
    fn elements_are_padded_to_eight_bytes() {
        let mut out = Vec::new();
        push_element(&mut out, MI_INT8, b"abc");
        assert_eq!(out.len(), 16);
        assert_eq!(&out[11..], &[0, 0, 0, 0, 0]);
    }
}
