//! NumPy array archives
//!
//! Writes `.npy` (format version 1.0) members into an uncompressed ZIP
//! container, the layout `numpy.savez` produces and `numpy.load` reads.
//! Entry timestamps are pinned to 1980-01-01 so identical arrays always
//! produce identical archive bytes.

use std::path::Path;

use flate2::Crc;

/// Element storage of one archive member
#[derive(Clone, Debug)]
pub enum NpyData {
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl NpyData {
    fn len(&self) -> usize {
        match self {
            NpyData::F64(v) => v.len(),
            NpyData::I64(v) => v.len(),
        }
    }

    fn descr(&self) -> &'static str {
        match self {
            NpyData::F64(_) => "<f8",
            NpyData::I64(_) => "<i8",
        }
    }
}

/// An n-dimensional array ready to be serialised
#[derive(Clone, Debug)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: NpyData,
    /// Whether `data` is laid out with the first axis varying fastest
    pub fortran_order: bool,
}

impl NpyArray {
    pub fn f64(shape: Vec<usize>, data: Vec<f64>) -> Self {
        NpyArray { shape, data: NpyData::F64(data), fortran_order: false }
    }

    pub fn i64(shape: Vec<usize>, data: Vec<i64>) -> Self {
        NpyArray { shape, data: NpyData::I64(data), fortran_order: false }
    }

    /// Mark the data as Fortran ordered (NIfTI voxel order)
    pub fn fortran(mut self) -> Self {
        self.fortran_order = true;
        self
    }
}

/// Serialise one array to `.npy` bytes
pub fn npy_bytes(array: &NpyArray) -> Result<Vec<u8>, String> {
    let expected: usize = array.shape.iter().product();
    if expected != array.data.len() {
        return Err(format!(
            "array of shape {:?} needs {} elements, got {}",
            array.shape,
            expected,
            array.data.len()
        ));
    }

    let shape = match array.shape.len() {
        0 => "()".to_string(),
        1 => format!("({},)", array.shape[0]),
        _ => {
            let dims: Vec<String> = array.shape.iter().map(|d| d.to_string()).collect();
            format!("({})", dims.join(", "))
        }
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': {}, 'shape': {}, }}",
        array.data.descr(),
        if array.fortran_order { "True" } else { "False" },
        shape
    );

    // magic(6) + version(2) + header_len(2) + header, padded to 64 bytes with '\n' last
    let unpadded = 10 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');
    if header.len() > u16::MAX as usize {
        return Err("npy header too long".to_string());
    }

    let mut out = Vec::with_capacity(10 + header.len() + array.data.len() * 8);
    out.extend_from_slice(b"\x93NUMPY");
    out.extend_from_slice(&[1u8, 0u8]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    match &array.data {
        NpyData::F64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        NpyData::I64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
    }
    Ok(out)
}

// DOS date for 1980-01-01, time 00:00:00
const ZIP_DOS_DATE: u16 = (1 << 5) | 1;
const ZIP_DOS_TIME: u16 = 0;
const ZIP_VERSION: u16 = 20;

/// Build an uncompressed ZIP holding `<name>.npy` for every entry
pub fn npz_bytes(entries: &[(&str, NpyArray)]) -> Result<Vec<u8>, String> {
    if entries.len() > u16::MAX as usize {
        return Err(format!("too many archive members ({})", entries.len()));
    }

    let mut out: Vec<u8> = Vec::new();
    let mut central: Vec<u8> = Vec::new();

    for (name, array) in entries {
        let member = format!("{}.npy", name);
        let payload = npy_bytes(array).map_err(|e| format!("member '{}': {}", member, e))?;
        if payload.len() > u32::MAX as usize || out.len() > u32::MAX as usize {
            return Err(format!("member '{}' exceeds the 4 GiB ZIP limit", member));
        }

        let mut crc = Crc::new();
        crc.update(&payload);
        let checksum = crc.sum();
        let size = payload.len() as u32;
        let offset = out.len() as u32;

        // Local file header
        push_u32(&mut out, 0x0403_4b50);
        push_u16(&mut out, ZIP_VERSION);
        push_u16(&mut out, 0); // flags
        push_u16(&mut out, 0); // stored
        push_u16(&mut out, ZIP_DOS_TIME);
        push_u16(&mut out, ZIP_DOS_DATE);
        push_u32(&mut out, checksum);
        push_u32(&mut out, size);
        push_u32(&mut out, size);
        push_u16(&mut out, member.len() as u16);
        push_u16(&mut out, 0); // extra field length
        out.extend_from_slice(member.as_bytes());
        out.extend_from_slice(&payload);

        // Central directory record
        push_u32(&mut central, 0x0201_4b50);
        push_u16(&mut central, ZIP_VERSION); // made by
        push_u16(&mut central, ZIP_VERSION); // needed
        push_u16(&mut central, 0);
        push_u16(&mut central, 0);
        push_u16(&mut central, ZIP_DOS_TIME);
        push_u16(&mut central, ZIP_DOS_DATE);
        push_u32(&mut central, checksum);
        push_u32(&mut central, size);
        push_u32(&mut central, size);
        push_u16(&mut central, member.len() as u16);
        push_u16(&mut central, 0); // extra
        push_u16(&mut central, 0); // comment
        push_u16(&mut central, 0); // disk number
        push_u16(&mut central, 0); // internal attributes
        push_u32(&mut central, 0); // external attributes
        push_u32(&mut central, offset);
        central.extend_from_slice(member.as_bytes());
    }

    if out.len() > u32::MAX as usize || central.len() > u32::MAX as usize {
        return Err("archive exceeds the 4 GiB ZIP limit".to_string());
    }
    let central_offset = out.len() as u32;
    let central_size = central.len() as u32;
    out.extend_from_slice(&central);

    // End of central directory
    push_u32(&mut out, 0x0605_4b50);
    push_u16(&mut out, 0);
    push_u16(&mut out, 0);
    push_u16(&mut out, entries.len() as u16);
    push_u16(&mut out, entries.len() as u16);
    push_u32(&mut out, central_size);
    push_u32(&mut out, central_offset);
    push_u16(&mut out, 0);

    Ok(out)
}

/// Write an `.npz` archive, replacing any existing file
pub fn write_npz(path: &Path, entries: &[(&str, NpyArray)]) -> Result<(), String> {
    let bytes = npz_bytes(entries)?;
    std::fs::write(path, bytes)
        .map_err(|e| format!("Failed to write archive '{}': {}", path.display(), e))
}

/// Parse `.npy` bytes written by [`npy_bytes`] (little-endian `f8`/`i8`)
pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray, String> {
    if bytes.len() < 10 || &bytes[0..6] != b"\x93NUMPY" {
        return Err("not an npy array".to_string());
    }
    if bytes[6] != 1 {
        return Err(format!("unsupported npy version {}.{}", bytes[6], bytes[7]));
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let header = bytes
        .get(10..10 + header_len)
        .ok_or("truncated npy header")?;
    let header = std::str::from_utf8(header).map_err(|_| "npy header is not ASCII")?;

    let fortran_order = header.contains("'fortran_order': True");
    let shape_start = header.find("'shape': (").ok_or("npy header has no shape")? + "'shape': (".len();
    let shape_end = header[shape_start..].find(')').ok_or("npy shape is not closed")? + shape_start;
    let shape = header[shape_start..shape_end]
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| d.parse::<usize>().map_err(|e| format!("bad npy dimension '{}': {}", d, e)))
        .collect::<Result<Vec<usize>, String>>()?;

    let payload = &bytes[10 + header_len..];
    let needed = shape
        .iter()
        .try_fold(8usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| format!("npy shape {:?} is too large", shape))?;
    if payload.len() != needed {
        return Err(format!("npy payload holds {} bytes, shape {:?} needs {}", payload.len(), shape, needed));
    }
    let words = payload.chunks_exact(8).map(|c| {
        let mut w = [0u8; 8];
        w.copy_from_slice(c);
        w
    });
    let data = if header.contains("'descr': '<f8'") {
        NpyData::F64(words.map(f64::from_le_bytes).collect())
    } else if header.contains("'descr': '<i8'") {
        NpyData::I64(words.map(i64::from_le_bytes).collect())
    } else {
        return Err("unsupported npy dtype".to_string());
    };
    Ok(NpyArray { shape, data, fortran_order })
}

/// Read every member of an uncompressed `.npz` archive, in stored order
pub fn read_npz(path: &Path) -> Result<Vec<(String, NpyArray)>, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("Failed to read archive '{}': {}", path.display(), e))?;

    let mut members = Vec::new();
    let mut at = 0;
    while at + 30 <= bytes.len() && read_u32(&bytes, at) == 0x0403_4b50 {
        let method = read_u16(&bytes, at + 8);
        let size = read_u32(&bytes, at + 18) as usize;
        let name_len = read_u16(&bytes, at + 26) as usize;
        let extra_len = read_u16(&bytes, at + 28) as usize;
        if method != 0 {
            return Err("compressed archive members are not supported".to_string());
        }
        let name_start = at + 30;
        let data_start = name_start + name_len + extra_len;
        let data = bytes
            .get(data_start..data_start + size)
            .ok_or("archive member is truncated")?;
        let name = String::from_utf8_lossy(&bytes[name_start..name_start + name_len]);
        let name = name.strip_suffix(".npy").unwrap_or(&name).to_string();
        let array = parse_npy(data).map_err(|e| format!("member '{}': {}", name, e))?;
        members.push((name, array));
        at = data_start + size;
    }
    if members.is_empty() {
        return Err(format!("'{}' holds no archive members", path.display()));
    }
    Ok(members)
}

fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
