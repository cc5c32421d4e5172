//! Shared-memory tensor channel
//!
//! Moves tensor data between the host and the worker through named segments
//! instead of the message stream. Only [`TensorDescriptor`]s travel over the
//! pipe; the bytes live in the segment directory.
//!
//! Ownership follows one rule per channel, `reader_closes_segment`:
//!
//! * inputs are created by the host. When the rule is set, the worker releases
//!   each input right after decoding it; otherwise the host releases it after
//!   the task reaches a terminal status.
//! * outputs are named by the host and written by the worker, which creates or
//!   resizes the segment as needed. The host releases them after decoding. When
//!   the rule is set, the host also creates an empty placeholder up front.
//!
//! Both processes must agree on the rule; the host passes its resolved value
//! to the worker at spawn time.

pub mod scope;
pub mod segment;

pub use scope::{ReleaseFailure, ReleaseReport, SegmentRole, SegmentScope};
pub use segment::{SegmentHeader, SharedSegment};

use crate::tensor::{DType, Tensor};
use std::path::{Path, PathBuf};
use tensorbridge_common::{BridgeConfig, BridgeError, Result, METRICS};
use tensorbridge_proto::TensorDescriptor;
use tracing::debug;
use uuid::Uuid;

/// Encodes tensors into segments and decodes them back
#[derive(Debug, Clone)]
pub struct ShmChannel {
    dir: PathBuf,
    reader_closes_segment: bool,
}

impl ShmChannel {
    /// Open a channel rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>, reader_closes_segment: bool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            BridgeError::segment(format!("Failed to create segment directory {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            reader_closes_segment,
        })
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Self::new(config.segment_dir(), config.reader_closes_segment())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn reader_closes_segment(&self) -> bool {
        self.reader_closes_segment
    }

    /// A segment name not used before
    pub fn fresh_name() -> String {
        format!("tb-{}", Uuid::new_v4().simple())
    }

    /// New cleanup scope for one request
    pub fn scope(&self) -> SegmentScope {
        SegmentScope::new(self.dir.clone(), self.reader_closes_segment)
    }

    /// Copy an input tensor into a fresh segment
    pub fn encode_input(&self, tensor: &Tensor, scope: &mut SegmentScope) -> Result<TensorDescriptor> {
        let dtype = tensor.dtype().ok_or_else(|| {
            BridgeError::invalid_input(format!("input tensor '{}' has no data", tensor.name()))
        })?;
        let name = Self::fresh_name();
        SharedSegment::create(&self.dir, &name, tensor)?;
        scope.track(name.clone(), SegmentRole::Input, true);
        self.record_write(tensor);

        Ok(TensorDescriptor::input(
            tensor.name(),
            tensor.shape().to_vec(),
            dtype.as_str(),
            name,
        ))
    }

    /// Describe an output slot. A populated tensor is copied in as the
    /// pre-shaped output; an empty one gets a placeholder.
    pub fn encode_output(&self, tensor: &Tensor, scope: &mut SegmentScope) -> Result<TensorDescriptor> {
        let name = Self::fresh_name();

        if let Some(dtype) = tensor.dtype() {
            SharedSegment::create(&self.dir, &name, tensor)?;
            scope.track(name.clone(), SegmentRole::Output, true);
            self.record_write(tensor);
            return Ok(TensorDescriptor::output(
                tensor.name(),
                tensor.shape().to_vec(),
                dtype.as_str(),
                name,
            ));
        }

        let created = self.reader_closes_segment;
        if created {
            SharedSegment::create_placeholder(&self.dir, &name)?;
            METRICS.segments.created.inc();
        }
        scope.track(name.clone(), SegmentRole::Output, created);
        Ok(TensorDescriptor::placeholder(tensor.name(), name))
    }

    /// Read the tensor a descriptor points at.
    ///
    /// Inputs are released here when the reader closes segments; outputs are
    /// left for the host's scope so they outlive the decoding of their siblings.
    pub fn decode(&self, descriptor: &TensorDescriptor) -> Result<Tensor> {
        descriptor.validate().map_err(BridgeError::protocol)?;

        let tensor = {
            let segment = SharedSegment::open(&self.dir, &descriptor.memory_name)?;
            let tensor = segment.read_tensor(&descriptor.name)?;
            check_descriptor(descriptor, &tensor)?;
            tensor
        };

        if descriptor.is_input && self.reader_closes_segment {
            self.release(&descriptor.memory_name)?;
        }
        Ok(tensor)
    }

    /// Worker side: write a produced output into the segment the host named
    pub fn write_output(&self, descriptor: &TensorDescriptor, tensor: &Tensor) -> Result<TensorDescriptor> {
        if descriptor.is_input {
            return Err(BridgeError::protocol(format!(
                "cannot write output into input segment '{}'",
                descriptor.memory_name
            )));
        }
        let dtype = tensor.dtype().ok_or_else(|| {
            BridgeError::engine(format!("model produced no data for output '{}'", descriptor.name))
        })?;

        SharedSegment::write(&self.dir, &descriptor.memory_name, tensor)?;
        self.record_write(tensor);
        debug!(segment = %descriptor.memory_name, tensor = %tensor, "Wrote output segment");

        Ok(TensorDescriptor::output(
            descriptor.name.clone(),
            tensor.shape().to_vec(),
            dtype.as_str(),
            descriptor.memory_name.clone(),
        ))
    }

    /// Release a segment by name
    pub fn release(&self, name: &str) -> Result<()> {
        segment::unlink(&self.dir, name)?;
        METRICS.segments.released.inc();
        Ok(())
    }

    fn record_write(&self, tensor: &Tensor) {
        METRICS.segments.created.inc();
        METRICS.segments.bytes_written.inc_by(tensor.byte_len() as u64);
    }
}

/// Descriptor metadata, when present, must match the segment header
fn check_descriptor(descriptor: &TensorDescriptor, tensor: &Tensor) -> Result<()> {
    if let Some(dtype) = &descriptor.dtype {
        let expected = DType::parse(dtype)
            .ok_or_else(|| BridgeError::protocol(format!("unknown dtype '{}'", dtype)))?;
        if tensor.dtype() != Some(expected) {
            return Err(BridgeError::protocol(format!(
                "segment '{}' holds {:?} data but descriptor says {}",
                descriptor.memory_name,
                tensor.dtype(),
                expected
            )));
        }
    }
    if let Some(shape) = &descriptor.shape {
        if shape.as_slice() != tensor.shape() {
            return Err(BridgeError::protocol(format!(
                "segment '{}' holds shape {:?} but descriptor says {:?}",
                descriptor.memory_name,
                tensor.shape(),
                shape
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorData;
    use half::f16;

    fn sample(dtype: DType) -> TensorData {
        match dtype {
            DType::Int8 => TensorData::I8(vec![-1, 0, 1, 2, 3, 4]),
            DType::Uint8 => TensorData::U8(vec![0, 1, 2, 3, 254, 255]),
            DType::Int16 => TensorData::I16(vec![-300, 0, 1, 2, 3, 300]),
            DType::Uint16 => TensorData::U16(vec![0, 1, 2, 3, 4, 65535]),
            DType::Int32 => TensorData::I32(vec![i32::MIN, -1, 0, 1, 2, i32::MAX]),
            DType::Uint32 => TensorData::U32(vec![0, 1, 2, 3, 4, u32::MAX]),
            DType::Int64 => TensorData::I64(vec![i64::MIN, -1, 0, 1, 2, i64::MAX]),
            DType::Float16 => TensorData::F16([0.5f32, -1.0, 2.0, 0.0, 3.25, 65504.0].iter().map(|v| f16::from_f32(*v)).collect()),
            DType::Float32 => TensorData::F32(vec![0.5, -1.0, 2.0, 0.0, 3.25, f32::MAX]),
            DType::Float64 => TensorData::F64(vec![0.5, -1.0, 2.0, 0.0, 3.25, f64::MIN_POSITIVE]),
        }
    }

    #[test]
    fn test_every_dtype_survives_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ShmChannel::new(dir.path(), false).unwrap();
        let mut scope = channel.scope();

        for dtype in DType::ALL {
            let tensor = Tensor::from_data("x", vec![2, 3], sample(dtype)).unwrap();
            let descriptor = channel.encode_input(&tensor, &mut scope).unwrap();
            assert_eq!(descriptor.dtype.as_deref(), Some(dtype.as_str()));
            assert_eq!(descriptor.shape, Some(vec![2, 3]));

            let decoded = channel.decode(&descriptor).unwrap();
            assert_eq!(decoded, tensor, "{} did not survive", dtype);
        }

        assert_eq!(scope.len(), DType::ALL.len());
        assert!(scope.release_all().is_clean());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_reader_releases_inputs_when_rule_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ShmChannel::new(dir.path(), true).unwrap();
        let mut scope = channel.scope();

        let tensor = Tensor::new("x", vec![3], vec![1u32, 2, 3]).unwrap();
        let descriptor = channel.encode_input(&tensor, &mut scope).unwrap();
        channel.decode(&descriptor).unwrap();
        assert!(!segment::exists(dir.path(), &descriptor.memory_name));

        let report = scope.release_all();
        assert!(report.is_clean());
        assert_eq!(report.released_by_reader, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_decodes_read_only_inputs() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let channel = ShmChannel::new(dir.path(), true).unwrap();
        let mut scope = channel.scope();

        let tensor = Tensor::new("x", vec![2], vec![4u16, 5]).unwrap();
        let descriptor = channel.encode_input(&tensor, &mut scope).unwrap();
        let path = dir.path().join(&descriptor.memory_name);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444)).unwrap();

        assert_eq!(channel.decode(&descriptor).unwrap(), tensor);
        assert!(!path.exists());
        assert!(scope.release_all().is_clean());
    }

    #[test]
    fn test_host_keeps_inputs_when_rule_is_clear() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ShmChannel::new(dir.path(), false).unwrap();
        let mut scope = channel.scope();

        let tensor = Tensor::new("x", vec![1], vec![5i8]).unwrap();
        let descriptor = channel.encode_input(&tensor, &mut scope).unwrap();
        channel.decode(&descriptor).unwrap();
        assert!(segment::exists(dir.path(), &descriptor.memory_name));

        assert_eq!(scope.release_all().released, 1);
    }

    #[test]
    fn test_placeholder_output_filled_by_writer() {
        for reader_closes in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let channel = ShmChannel::new(dir.path(), reader_closes).unwrap();
            let mut scope = channel.scope();

            let descriptor = channel.encode_output(&Tensor::empty("y"), &mut scope).unwrap();
            assert!(descriptor.is_placeholder());
            assert_eq!(segment::exists(dir.path(), &descriptor.memory_name), reader_closes);

            let produced = Tensor::new("y", vec![2, 2], vec![1.0f64, 2.0, 3.0, 4.0]).unwrap();
            let written = channel.write_output(&descriptor, &produced).unwrap();
            assert_eq!(written.shape, Some(vec![2, 2]));
            assert_eq!(written.dtype.as_deref(), Some("float64"));

            let decoded = channel.decode(&descriptor).unwrap();
            assert_eq!(decoded, produced);
            // Outputs stay until the scope releases them
            assert!(segment::exists(dir.path(), &descriptor.memory_name));

            assert_eq!(scope.release_all().released, 1);
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        }
    }

    #[test]
    fn test_descriptor_mismatch_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ShmChannel::new(dir.path(), false).unwrap();
        let mut scope = channel.scope();

        let tensor = Tensor::new("x", vec![2], vec![1i32, 2]).unwrap();
        let mut descriptor = channel.encode_input(&tensor, &mut scope).unwrap();

        descriptor.dtype = Some("float32".to_string());
        assert!(matches!(channel.decode(&descriptor), Err(BridgeError::ProtocolViolation(_))));

        descriptor.dtype = Some("int32".to_string());
        descriptor.shape = Some(vec![1, 2]);
        assert!(matches!(channel.decode(&descriptor), Err(BridgeError::ProtocolViolation(_))));
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ShmChannel::new(dir.path(), false).unwrap();
        let mut scope = channel.scope();

        let err = channel.encode_input(&Tensor::empty("x"), &mut scope).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInput(_)));
        assert!(scope.is_empty());
    }
}
