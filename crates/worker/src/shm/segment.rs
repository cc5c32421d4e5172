//! Named, memory-mapped segment files
//!
//! A segment is a file in the segment directory, mapped into both processes.
//! A populated segment starts with a header describing the tensor it holds:
//!
//! ```text
//! 0..4    magic "TBSM"
//! 4       format version
//! 5       dtype code
//! 6..8    reserved
//! 8..12   ndim (u32 LE)
//! 12..16  reserved
//! 16..    ndim × u64 LE dimensions, then the element data (LE)
//! ```
//!
//! A zero-length file is a placeholder: its name is reserved but nothing has
//! been written yet.

use crate::tensor::{element_count, DType, Tensor, TensorData};
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tensorbridge_common::{BridgeError, Result};

const MAGIC: &[u8; 4] = b"TBSM";
const FORMAT_VERSION: u8 = 1;
const FIXED_HEADER_LEN: usize = 16;

/// Tensor metadata stored at the start of a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl SegmentHeader {
    pub fn for_tensor(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
        }
    }

    /// Header size including the dimension table
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + 8 * self.shape.len()
    }

    /// Element data size, `None` if it does not fit in memory
    pub fn payload_len(&self) -> Option<usize> {
        element_count(&self.shape)?.checked_mul(self.dtype.size())
    }

    /// Total segment size, `None` if it does not fit in memory
    pub fn segment_len(&self) -> Option<usize> {
        self.encoded_len().checked_add(self.payload_len()?)
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = FORMAT_VERSION;
        buf[5] = self.dtype.code();
        buf[6..8].fill(0);
        buf[8..12].copy_from_slice(&(self.shape.len() as u32).to_le_bytes());
        buf[12..16].fill(0);
        for (i, dim) in self.shape.iter().enumerate() {
            let start = FIXED_HEADER_LEN + 8 * i;
            buf[start..start + 8].copy_from_slice(&(*dim as u64).to_le_bytes());
        }
    }

    fn read_from(name: &str, buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_HEADER_LEN || &buf[0..4] != MAGIC {
            return Err(BridgeError::protocol(format!("segment '{}' has no tensor header", name)));
        }
        if buf[4] != FORMAT_VERSION {
            return Err(BridgeError::protocol(format!(
                "segment '{}' has unsupported format version {}",
                name, buf[4]
            )));
        }
        let dtype = DType::from_code(buf[5]).ok_or_else(|| {
            BridgeError::protocol(format!("segment '{}' has unknown dtype code {}", name, buf[5]))
        })?;
        let ndim = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let table_end = ndim
            .checked_mul(8)
            .and_then(|table| table.checked_add(FIXED_HEADER_LEN))
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| {
                BridgeError::protocol(format!(
                    "segment '{}' is truncated: header declares {} dimensions",
                    name, ndim
                ))
            })?;
        let shape = buf[FIXED_HEADER_LEN..table_end]
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                usize::try_from(u64::from_le_bytes(raw))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| BridgeError::protocol(format!("segment '{}' has a dimension too large", name)))?;

        let header = Self { dtype, shape };
        let needed = header.segment_len().ok_or_else(|| {
            BridgeError::protocol(format!(
                "segment '{}' declares shape {:?} which overflows",
                name, header.shape
            ))
        })?;
        if buf.len() < needed {
            return Err(BridgeError::protocol(format!(
                "segment '{}' is truncated: {} bytes, header needs {}",
                name,
                buf.len(),
                needed
            )));
        }
        Ok(header)
    }
}

/// Reject names that could escape the segment directory
pub fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BridgeError::protocol(format!("invalid segment name '{}'", name)))
    }
}

/// Path of a named segment
pub fn segment_path(dir: &Path, name: &str) -> Result<PathBuf> {
    check_name(name)?;
    Ok(dir.join(name))
}

fn not_found(name: &str) -> BridgeError {
    BridgeError::SegmentNotFound(name.to_string())
}

fn map_error(name: &str, e: std::io::Error) -> BridgeError {
    BridgeError::segment(format!("Failed to map segment '{}': {}", name, e))
}

fn map_file_mut(name: &str, file: &File) -> Result<MmapMut> {
    // Segment files are only written by the side that currently owns the task
    unsafe { MmapMut::map_mut(file).map_err(|e| map_error(name, e)) }
}

fn map_file(name: &str, file: &File) -> Result<Mmap> {
    unsafe { Mmap::map(file).map_err(|e| map_error(name, e)) }
}

/// An open, read-only segment mapping
pub struct SharedSegment {
    name: String,
    mmap: Option<Mmap>,
}

impl SharedSegment {
    /// Create a new segment holding `tensor`. Fails if the name is taken.
    pub fn create(dir: &Path, name: &str, tensor: &Tensor) -> Result<Self> {
        let data = tensor.data().ok_or_else(|| {
            BridgeError::invalid_input(format!("tensor '{}' has no data to share", tensor.name()))
        })?;
        let path = segment_path(dir, name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| BridgeError::segment(format!("Failed to create segment '{}': {}", name, e)))?;
        Self::fill(name, &file, tensor.shape(), data)
    }

    /// Create a zero-length placeholder. Fails if the name is taken.
    pub fn create_placeholder(dir: &Path, name: &str) -> Result<()> {
        let path = segment_path(dir, name)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| BridgeError::segment(format!("Failed to create segment '{}': {}", name, e)))?;
        Ok(())
    }

    /// Write `tensor` into the named segment, creating it or resizing an
    /// existing placeholder as needed
    pub fn write(dir: &Path, name: &str, tensor: &Tensor) -> Result<Self> {
        let data = tensor.data().ok_or_else(|| {
            BridgeError::invalid_input(format!("tensor '{}' has no data to share", tensor.name()))
        })?;
        let path = segment_path(dir, name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BridgeError::segment(format!("Failed to open segment '{}': {}", name, e)))?;
        Self::fill(name, &file, tensor.shape(), data)
    }

    fn fill(name: &str, file: &File, shape: &[usize], data: &TensorData) -> Result<Self> {
        let header = SegmentHeader::for_tensor(data.dtype(), shape);
        let len = header.segment_len().ok_or_else(|| {
            BridgeError::segment(format!("tensor shape {:?} is too large for segment '{}'", shape, name))
        })?;
        let current = file.metadata()?.len();
        if current != len as u64 {
            file.set_len(len as u64)
                .map_err(|e| BridgeError::segment(format!("Failed to size segment '{}': {}", name, e)))?;
        }

        let mut mmap = map_file_mut(name, file)?;
        header.write_to(&mut mmap[..header.encoded_len()]);
        data.write_le(&mut mmap[header.encoded_len()..])?;
        mmap.flush()
            .map_err(|e| BridgeError::segment(format!("Failed to flush segment '{}': {}", name, e)))?;
        let mmap = mmap.make_read_only().map_err(|e| map_error(name, e))?;

        Ok(Self {
            name: name.to_string(),
            mmap: Some(mmap),
        })
    }

    /// Open an existing segment for reading
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = segment_path(dir, name)?;
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => not_found(name),
                _ => BridgeError::segment(format!("Failed to open segment '{}': {}", name, e)),
            })?;

        // Zero-length files cannot be mapped on every platform
        let mmap = if file.metadata()?.len() == 0 {
            None
        } else {
            Some(map_file(name, &file)?)
        };

        Ok(Self {
            name: name.to_string(),
            mmap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment size in bytes
    pub fn len(&self) -> usize {
        self.mmap.as_ref().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether nothing has been written to the segment yet
    pub fn is_placeholder(&self) -> bool {
        self.mmap.is_none()
    }

    /// Parsed header, or `None` for a placeholder
    pub fn header(&self) -> Result<Option<SegmentHeader>> {
        match &self.mmap {
            Some(mmap) => SegmentHeader::read_from(&self.name, mmap).map(Some),
            None => Ok(None),
        }
    }

    /// Copy the segment out into a tensor
    pub fn read_tensor(&self, tensor_name: &str) -> Result<Tensor> {
        let mmap = self.mmap.as_ref().ok_or_else(|| {
            BridgeError::protocol(format!(
                "segment '{}' for tensor '{}' was never written",
                self.name, tensor_name
            ))
        })?;
        let header = SegmentHeader::read_from(&self.name, mmap)?;
        let start = header.encoded_len();
        // read_from checked that the payload fits in the mapping
        let end = header.segment_len().unwrap_or(mmap.len());
        let payload = &mmap[start..end];
        let data = TensorData::from_le_bytes(header.dtype, payload)?;
        Tensor::from_data(tensor_name, header.shape, data)
    }
}

/// Remove a segment's name. The mapping stays valid in processes that
/// still hold it.
pub fn unlink(dir: &Path, name: &str) -> Result<()> {
    let path = segment_path(dir, name)?;
    std::fs::remove_file(&path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => not_found(name),
        _ => BridgeError::segment(format!("Failed to release segment '{}': {}", name, e)),
    })
}

/// Whether a segment currently exists
pub fn exists(dir: &Path, name: &str) -> bool {
    segment_path(dir, name).map(|p| p.exists()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_roundtrip_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let tensor = Tensor::new("x", vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        let created = SharedSegment::create(dir.path(), "tb-test", &tensor).unwrap();
        assert_eq!(created.len(), 16 + 2 * 8 + 6 * 4);

        let opened = SharedSegment::open(dir.path(), "tb-test").unwrap();
        let header = opened.header().unwrap().unwrap();
        assert_eq!(header.dtype, DType::Float32);
        assert_eq!(header.shape, vec![2, 3]);
        assert_eq!(opened.read_tensor("x").unwrap(), tensor);

        // Name is taken
        assert!(SharedSegment::create(dir.path(), "tb-test", &tensor).is_err());
    }

    #[test]
    fn test_placeholder_is_resized_by_writer() {
        let dir = tempfile::tempdir().unwrap();
        SharedSegment::create_placeholder(dir.path(), "tb-out").unwrap();

        let placeholder = SharedSegment::open(dir.path(), "tb-out").unwrap();
        assert!(placeholder.is_placeholder());
        assert!(placeholder.header().unwrap().is_none());
        assert!(matches!(placeholder.read_tensor("y"), Err(BridgeError::ProtocolViolation(_))));

        let output = Tensor::new("y", vec![4], vec![7i64, 8, 9, 10]).unwrap();
        SharedSegment::write(dir.path(), "tb-out", &output).unwrap();
        let read = SharedSegment::open(dir.path(), "tb-out").unwrap().read_tensor("y").unwrap();
        assert_eq!(read, output);

        // Shrinking rewrite
        let smaller = Tensor::new("y", vec![1], vec![1u8]).unwrap();
        SharedSegment::write(dir.path(), "tb-out", &smaller).unwrap();
        let read = SharedSegment::open(dir.path(), "tb-out").unwrap().read_tensor("y").unwrap();
        assert_eq!(read, smaller);
    }

    #[test]
    fn test_unlink_and_missing_segments() {
        let dir = tempfile::tempdir().unwrap();
        let tensor = Tensor::new("x", vec![1], vec![3i32]).unwrap();
        SharedSegment::create(dir.path(), "tb-gone", &tensor).unwrap();
        assert!(exists(dir.path(), "tb-gone"));

        unlink(dir.path(), "tb-gone").unwrap();
        assert!(!exists(dir.path(), "tb-gone"));
        assert!(matches!(unlink(dir.path(), "tb-gone"), Err(BridgeError::SegmentNotFound(_))));
        assert!(matches!(
            SharedSegment::open(dir.path(), "tb-gone"),
            Err(BridgeError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_bad_names_and_headers() {
        let dir = tempfile::tempdir().unwrap();
        assert!(segment_path(dir.path(), "../etc/passwd").is_err());
        assert!(segment_path(dir.path(), "").is_err());

        std::fs::write(dir.path().join("tb-junk"), b"not a tensor segment").unwrap();
        let junk = SharedSegment::open(dir.path(), "tb-junk").unwrap();
        assert!(matches!(junk.read_tensor("x"), Err(BridgeError::ProtocolViolation(_))));
    }

    fn raw_header(dims: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(FORMAT_VERSION);
        buf.push(DType::Float32.code());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&(dims.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        for dim in dims {
            buf.extend_from_slice(&dim.to_le_bytes());
        }
        buf
    }

    #[test]
    fn test_overflowing_dimensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tb-huge"), raw_header(&[u64::MAX, 4])).unwrap();

        let huge = SharedSegment::open(dir.path(), "tb-huge").unwrap();
        assert!(matches!(huge.header(), Err(BridgeError::ProtocolViolation(_))));
        assert!(matches!(huge.read_tensor("y"), Err(BridgeError::ProtocolViolation(_))));

        // Fits in usize but not in the file
        std::fs::write(dir.path().join("tb-short"), raw_header(&[1 << 20, 4])).unwrap();
        let short = SharedSegment::open(dir.path(), "tb-short").unwrap();
        assert!(matches!(short.read_tensor("y"), Err(BridgeError::ProtocolViolation(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_segment_can_be_read() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tensor = Tensor::new("x", vec![3], vec![1i16, -2, 3]).unwrap();
        SharedSegment::create(dir.path(), "tb-ro", &tensor).unwrap();

        let path = dir.path().join("tb-ro");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444)).unwrap();

        let opened = SharedSegment::open(dir.path(), "tb-ro").unwrap();
        assert_eq!(opened.read_tensor("x").unwrap(), tensor);

        // Removing a name only needs the directory to be writable
        unlink(dir.path(), "tb-ro").unwrap();
    }
}
