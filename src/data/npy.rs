//! Minimal NPY v1.0 support for dense little-endian `f64` matrices.
//!
//! Only what the sync-frame archive needs: C order, two dimensions, `<f8`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

/// Write a `rows x cols` row-major matrix.
pub fn write_f64(path: &Path, rows: usize, cols: usize, data: &[f64]) -> io::Result<()> {
    if data.len() != rows * cols {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} values do not fill a {}x{} matrix", data.len(), rows, cols),
        ));
    }

    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, {}), }}",
        rows, cols
    );
    // magic + version + u16 length + header + newline, padded to the alignment
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let header_len = u16::try_from(header.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "npy header too long"))?;

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;
    out.write_all(&[1, 0])?;
    out.write_all(&header_len.to_le_bytes())?;
    out.write_all(header.as_bytes())?;
    for v in data {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()
}

/// Read a matrix written by [`write_f64`]. Returns `(rows, cols, data)`.
pub fn read_f64(path: &Path) -> io::Result<(usize, usize, Vec<f64>)> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    let mut input = BufReader::new(File::open(path)?);
    let mut preamble = [0u8; 10];
    input.read_exact(&mut preamble)?;
    if &preamble[..6] != MAGIC || preamble[6] != 1 {
        return Err(invalid("not an NPY v1 file"));
    }
    let header_len = u16::from_le_bytes([preamble[8], preamble[9]]) as usize;
    let mut header = vec![0u8; header_len];
    input.read_exact(&mut header)?;
    let header = String::from_utf8(header).map_err(|_| invalid("header is not text"))?;

    if !header.contains("'<f8'") || header.contains("'fortran_order': True") {
        return Err(invalid("only C-order <f8 arrays are supported"));
    }
    let shape = header
        .split_once("'shape': (")
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(dims, _)| dims)
        .ok_or_else(|| invalid("missing shape"))?;
    let dims: Vec<usize> = shape
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| d.parse().map_err(|_| invalid("bad dimension")))
        .collect::<io::Result<_>>()?;
    let (rows, cols) = match dims.as_slice() {
        [r, c] => (*r, *c),
        _ => return Err(invalid("expected a 2-D array")),
    };

    let mut data = Vec::with_capacity(rows * cols);
    let mut cell = [0u8; 8];
    for _ in 0..rows * cols {
        input.read_exact(&mut cell)?;
        data.push(f64::from_le_bytes(cell));
    }
    Ok((rows, cols, data))
}
