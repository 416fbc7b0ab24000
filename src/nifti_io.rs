//! NIfTI file I/O
//!
//! Reads 3-D and 4-D NIfTI-1 images (plain or gzipped) and writes
//! single-file float32 NIfTI-1 with the sform set from the image affine.
//! Codec functions report `String` errors; the `read_*`/`write_*` helpers
//! at the bottom lift them into [`PipelineError::Io`] with the path attached.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{PipelineError, Result};
use crate::utils::Affine;
use crate::volume::{DiffusionStack, Geometry, Volume};

/// NIfTI data loaded from bytes
pub struct NiftiData {
    /// Voxel data as f64, volumes back to back in Fortran order
    pub data: Vec<f64>,
    /// Spatial dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Number of volumes along the 4th axis (1 for 3-D images)
    pub n_volumes: usize,
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: Affine,
}

impl NiftiData {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.dims, self.voxel_size).with_affine(self.affine)
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Load a NIfTI image from bytes
///
/// Supports both .nii and .nii.gz content (gzip is auto-detected) and
/// returns every volume of a 4-D image.
pub fn load_nifti(bytes: &[u8]) -> std::result::Result<NiftiData, String> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        let decoder = GzDecoder::new(Cursor::new(bytes));
        InMemNiftiObject::from_reader(decoder).map_err(|e| {
            let mut decoder2 = GzDecoder::new(Cursor::new(bytes));
            let mut decompressed = Vec::new();
            let info = if std::io::Read::read_to_end(&mut decoder2, &mut decompressed).is_ok() {
                get_header_info(&decompressed)
            } else {
                "Could not decompress".to_string()
            };
            format!("Failed to read gzipped NIfTI: {} ({})", e, info)
        })?
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| format!("Failed to read NIfTI: {} ({})", e, info))?
    };

    let header = obj.header();
    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(format!("Expected at least 3D volume, got {}D", ndim));
    }

    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);
    let affine = get_affine(header);

    // into_ndarray applies scl_slope / scl_inter
    let volume = obj.into_volume();
    let array: Array<f64, _> = volume
        .into_ndarray()
        .map_err(|e| format!("Failed to convert to ndarray: {}", e))?;

    // Use the actual array shape (nifti-rs may drop trailing singleton axes)
    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(format!("Expected at least 3D array, got {}D", shape.len()));
    }
    if shape.len() > 4 {
        return Err(format!("Expected at most 4D data, got shape {:?}", shape));
    }
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };

    // Fortran order, volume by volume: x + y*nx + z*nx*ny + t*nx*ny*nz
    let mut data = Vec::with_capacity(nx * ny * nz * nt);
    if shape.len() == 3 {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data.push(array[[i, j, k]]);
                }
            }
        }
    } else {
        for t in 0..nt {
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx {
                        data.push(array[[i, j, k, t]]);
                    }
                }
            }
        }
    }

    Ok(NiftiData {
        data,
        dims: (nx, ny, nz),
        n_volumes: nt,
        voxel_size,
        affine,
    })
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> Affine {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        // Fall back to identity with voxel scaling
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Encode volumes as uncompressed NIfTI-1 bytes
///
/// `data` holds `n_volumes` volumes back to back; a single volume is written
/// as a 3-D image, more as a 4-D image.
pub fn save_nifti(
    data: &[f64],
    geometry: &Geometry,
    n_volumes: usize,
) -> std::result::Result<Vec<u8>, String> {
    let (nx, ny, nz) = geometry.dims;
    let (vsx, vsy, vsz) = geometry.voxel_size;
    let affine = &geometry.affine;

    if data.len() != nx * ny * nz * n_volumes {
        return Err(format!(
            "Data length {} does not match {}x{}x{}x{}",
            data.len(), nx, ny, nz, n_volumes
        ));
    }
    for &d in &[nx, ny, nz, n_volumes] {
        if d == 0 || d > i16::MAX as usize {
            return Err(format!("Dimension {} cannot be stored in a NIfTI-1 header", d));
        }
    }

    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim: i16 = if n_volumes > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, n_volumes as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // xyzt_units = mm + s
    header[123] = 2 | 8;

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for i in 0..4 {
            let offset = 280 + row * 16 + i * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + i] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.extend_from_slice(&header);
    // Extension flag (4 bytes, all zeros = no extension)
    buffer.extend_from_slice(&[0u8; 4]);
    for &val in data {
        buffer.extend_from_slice(&(val as f32).to_le_bytes());
    }

    Ok(buffer)
}

/// Encode volumes as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(
    data: &[f64],
    geometry: &Geometry,
    n_volumes: usize,
) -> std::result::Result<Vec<u8>, String> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = save_nifti(data, geometry, n_volumes)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&uncompressed)
        .map_err(|e| format!("Gzip compression failed: {}", e))?;

    encoder.finish()
        .map_err(|e| format!("Gzip finish failed: {}", e))
}

/// Read a NIfTI file from a filesystem path
///
/// Supports both .nii and .nii.gz files.
pub fn read_nifti_file(path: &Path) -> std::result::Result<NiftiData, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e))?;
    load_nifti(&bytes)
}

/// Save volumes to a file
///
/// If the path ends with .nii.gz, the file is gzip compressed.
/// Otherwise it is saved as uncompressed .nii.
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f64],
    geometry: &Geometry,
    n_volumes: usize,
) -> std::result::Result<(), String> {
    let path_str = path.to_string_lossy();
    let bytes = if path_str.ends_with(".nii.gz") {
        save_nifti_gz(data, geometry, n_volumes)?
    } else {
        save_nifti(data, geometry, n_volumes)?
    };

    std::fs::write(path, &bytes)
        .map_err(|e| format!("Failed to write file '{}': {}", path.display(), e))
}

// ============================================================================
// Typed helpers used by the pipeline stages
// ============================================================================

/// Read a 3-D volume; the first volume is taken from 4-D files
pub fn read_volume(path: &Path) -> Result<Volume> {
    let nii = read_nifti_file(path).map_err(|e| PipelineError::io(path, e))?;
    let geometry = nii.geometry();
    let n = geometry.n_voxels();
    let mut data = nii.data;
    data.truncate(n);
    Volume::new(data, geometry)
}

/// Read a 4-D diffusion stack (a 3-D file is a one-volume stack)
pub fn read_stack(path: &Path) -> Result<DiffusionStack> {
    let nii = read_nifti_file(path).map_err(|e| PipelineError::io(path, e))?;
    let geometry = nii.geometry();
    DiffusionStack::new(nii.data, geometry, nii.n_volumes)
}

pub fn write_volume(path: &Path, volume: &Volume) -> Result<()> {
    save_nifti_to_file(path, &volume.data, &volume.geometry, 1)
        .map_err(|e| PipelineError::io(path, e))
}

pub fn write_stack(path: &Path, stack: &DiffusionStack) -> Result<()> {
    save_nifti_to_file(path, &stack.data, &stack.geometry, stack.n_volumes)
        .map_err(|e| PipelineError::io(path, e))
}
