//! NumPy `.npy` v1.0 writer for 2-D float64 arrays

use std::io::{self, Write};

const MAGIC: &[u8] = b"\x93NUMPY";
const ALIGN: usize = 64;

/// Write `rows` as a C-ordered `<f8` array of shape `(rows.len(), n)`.
///
/// Every row must have the same length.
pub fn write_f64_rows<W: Write>(mut w: W, rows: &[&[f64]]) -> io::Result<()> {
    let cols = rows.first().map_or(0, |r| r.len());
    if rows.iter().any(|r| r.len() != cols) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "npy rows differ in length",
        ));
    }

    let dict = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, {}), }}",
        rows.len(),
        cols
    );
    // magic + version + u16 length + dict + padding + '\n' is a multiple of 64
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (ALIGN - unpadded % ALIGN) % ALIGN;
    let header_len = dict.len() + padding + 1;

    w.write_all(MAGIC)?;
    w.write_all(&[1, 0])?;
    w.write_all(&(header_len as u16).to_le_bytes())?;
    w.write_all(dict.as_bytes())?;
    w.write_all(&vec![b' '; padding])?;
    w.write_all(b"\n")?;

    for row in rows {
        for value in row.iter() {
            w.write_all(&value.to_le_bytes())?;
        }
    }
    w.flush()
}
