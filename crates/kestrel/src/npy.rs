// =============================================================================
// NumPy .npy: single-array files
// =============================================================================
//
// Layout of a .npy file:
//
//   magic "\x93NUMPY" | major | minor | header_len | header | raw data
//
//   v1.0: header_len is a u16 LE; v2.0 and v3.0: a u32 LE.
//   header: a Python dict literal padded with spaces and a trailing '\n' so
//   that the data starts on a 64-byte boundary, e.g.
//     {'descr': '<f4', 'fortran_order': False, 'shape': (2, 3), }
//
// Supported descriptors: <f4, <f8, <i4 (with '=' or '|' byte-order marks
// accepted on little-endian hosts). Fortran-ordered payloads are loaded into
// ordinary row-major arrays. Files are always written in C order.
//
// Usage:
//   npy::save("w.npy", tensor.w())?;
//   let w = npy::load("w.npy")?;
//   npy::save_tensors("checkpoint/", &params)?;   // param_0.npy, param_1.npy, ...

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use kestrel_core::{Array, DType, Error, Result, Shape, Tensor};

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const ALIGN: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Header parsing (Python dict literal, no external parser)
// ─────────────────────────────────────────────────────────────────────────────

struct Header {
    dtype: DType,
    fortran_order: bool,
    shape: Vec<usize>,
}

fn npy_err(msg: impl Into<String>) -> Error {
    Error::Npy(msg.into())
}

/// The text following `'key':` (or `"key":`) in the header dict.
fn value_after<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    for quote in ['\'', '"'] {
        let pattern = format!("{quote}{key}{quote}");
        if let Some(pos) = header.find(&pattern) {
            let rest = header[pos + pattern.len()..].trim_start();
            let rest = rest
                .strip_prefix(':')
                .ok_or_else(|| npy_err(format!("missing ':' after {key}")))?;
            return Ok(rest.trim_start());
        }
    }
    Err(npy_err(format!("header has no '{key}' entry")))
}

fn parse_descr(header: &str) -> Result<DType> {
    let rest = value_after(header, "descr")?;
    let quote = rest
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| npy_err("descr is not a string"))?;
    let body = &rest[1..];
    let end = body
        .find(quote)
        .ok_or_else(|| npy_err("unterminated descr string"))?;
    let descr = &body[..end];
    DType::from_numpy_descr(descr).ok_or_else(|| npy_err(format!("unsupported descr '{descr}'")))
}

fn parse_fortran_order(header: &str) -> Result<bool> {
    let rest = value_after(header, "fortran_order")?;
    if rest.starts_with("True") {
        Ok(true)
    } else if rest.starts_with("False") {
        Ok(false)
    } else {
        Err(npy_err("fortran_order is neither True nor False"))
    }
}

fn parse_shape(header: &str) -> Result<Vec<usize>> {
    let rest = value_after(header, "shape")?;
    let body = rest
        .strip_prefix('(')
        .ok_or_else(|| npy_err("shape is not a tuple"))?;
    let end = body
        .find(')')
        .ok_or_else(|| npy_err("unterminated shape tuple"))?;
    body[..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            // numpy on some platforms writes `3L`
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|e| npy_err(format!("bad shape entry '{s}': {e}")))
        })
        .collect()
}

fn parse_header(header: &str) -> Result<Header> {
    Ok(Header {
        dtype: parse_descr(header)?,
        fortran_order: parse_fortran_order(header)?,
        shape: parse_shape(header)?,
    })
}

/// Split raw file bytes into the parsed header and the data payload.
fn split_file(bytes: &[u8]) -> Result<(Header, &[u8])> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(npy_err("not a .npy file (bad magic)"));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(npy_err("truncated header length"));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        v => return Err(npy_err(format!("unsupported format version {v}"))),
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(npy_err("truncated header"));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|e| npy_err(format!("header is not UTF-8: {e}")))?;
    Ok((parse_header(header)?, &bytes[data_start..]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload decoding / encoding
// ─────────────────────────────────────────────────────────────────────────────

fn decode(data: &[u8], dtype: DType, shape: Shape) -> Result<Array> {
    let expected = shape
        .checked_elem_count()
        .and_then(|count| count.checked_mul(dtype.size_in_bytes()))
        .ok_or_else(|| npy_err(format!("shape {shape} overflows usize")))?;
    if data.len() < expected {
        return Err(npy_err(format!(
            "expected {expected} data bytes for shape {shape}, got {}",
            data.len()
        )));
    }
    let data = &data[..expected];
    match dtype {
        DType::F32 => {
            let values: Vec<f32> = data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Array::from_vec(values, shape)
        }
        DType::F64 => {
            let values: Vec<f64> = data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Array::from_vec(values, shape)
        }
        DType::I32 => {
            let values: Vec<i32> = data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Array::from_vec(values, shape)
        }
    }
}

fn encode(array: &Array) -> Result<Vec<u8>> {
    Ok(match array.dtype() {
        DType::F32 => array
            .to_vec::<f32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F64 => array
            .to_vec::<f64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::I32 => array
            .to_vec::<i32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
    })
}

fn shape_tuple(dims: &[usize]) -> String {
    match dims {
        [] => "()".to_string(),
        [d] => format!("({d},)"),
        _ => {
            let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}

/// Magic, version, length and padded header for a C-ordered array.
fn header_bytes(dtype: DType, dims: &[usize]) -> Vec<u8> {
    let mut dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        dtype.numpy_descr(),
        shape_tuple(dims)
    );
    // v1 if the padded header fits a u16 length, else v2
    let (version, prefix) = if dict.len() + 1 + 10 + ALIGN <= u16::MAX as usize {
        (1u8, 10)
    } else {
        (2u8, 12)
    };
    let unpadded = prefix + dict.len() + 1;
    let padding = (ALIGN - unpadded % ALIGN) % ALIGN;
    dict.extend(std::iter::repeat(' ').take(padding));
    dict.push('\n');

    let mut out = Vec::with_capacity(prefix + dict.len());
    out.extend_from_slice(MAGIC);
    out.push(version);
    out.push(0);
    if version == 1 {
        out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    } else {
        out.extend_from_slice(&(dict.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(dict.as_bytes());
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a complete .npy image held in memory.
pub fn from_bytes(bytes: &[u8]) -> Result<Array> {
    let (header, data) = split_file(bytes)?;
    if !header.fortran_order {
        return decode(data, header.dtype, Shape::new(header.shape));
    }
    // A Fortran payload is the row-major layout of the reversed shape;
    // reversing the axes again gives the logical array.
    let rank = header.shape.len();
    let reversed: Vec<usize> = header.shape.iter().rev().copied().collect();
    let mut array = decode(data, header.dtype, Shape::new(reversed))?;
    for axis in 0..rank / 2 {
        array = array.swap_axes(axis, rank - 1 - axis)?;
    }
    array.contiguous()
}

/// Serialize `array` (any layout) as a C-ordered .npy image.
pub fn to_bytes(array: &Array) -> Result<Vec<u8>> {
    let mut bytes = header_bytes(array.dtype(), array.dims());
    bytes.extend(encode(array)?);
    Ok(bytes)
}

/// Read an array from a .npy file.
pub fn load(path: impl AsRef<Path>) -> Result<Array> {
    let mut bytes = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut bytes)?;
    from_bytes(&bytes)
}

/// Write an array to a .npy file.
pub fn save(path: impl AsRef<Path>, array: &Array) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    writer.write_all(&to_bytes(array)?)?;
    writer.flush()?;
    Ok(())
}

/// Read a .npy file into a new tensor (zero gradient).
pub fn load_tensor(path: impl AsRef<Path>) -> Result<Tensor> {
    Tensor::from_array(load(path)?)
}

/// Write a tensor's value to a .npy file.
pub fn save_tensor(path: impl AsRef<Path>, tensor: &Tensor) -> Result<()> {
    save(path, tensor.w())
}

fn param_path(dir: &Path, index: usize) -> std::path::PathBuf {
    dir.join(format!("param_{index}.npy"))
}

/// Write each parameter's value to `dir/param_{i}.npy`, creating `dir`.
pub fn save_tensors(dir: impl AsRef<Path>, params: &[Tensor]) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    for (i, param) in params.iter().enumerate() {
        save_tensor(param_path(dir, i), param)?;
    }
    Ok(())
}

/// Overwrite each parameter's value in place from `dir/param_{i}.npy`.
/// Shapes and dtypes must match the files.
pub fn load_tensors(dir: impl AsRef<Path>, params: &[Tensor]) -> Result<()> {
    let dir = dir.as_ref();
    for (i, param) in params.iter().enumerate() {
        let loaded = load(param_path(dir, i))?;
        if loaded.shape() != param.shape() {
            return Err(Error::ShapeMismatch {
                expected: param.shape().clone(),
                got: loaded.shape().clone(),
            });
        }
        param.w().set(&loaded)?;
    }
    Ok(())
}
