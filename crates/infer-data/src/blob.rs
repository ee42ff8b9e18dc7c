use std::collections::BTreeMap;

use thiserror::Error;

/// Output tensors of one inference request, keyed by layer name.
///
/// Iteration follows the lexicographic layer order, which keeps the
/// cross-layer candidate order stable between runs.
pub type BlobMap = BTreeMap<String, OutputBlob>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("batch index {batch} out of range for blob with {batches} samples")]
    BatchOutOfRange { batch: usize, batches: usize },
    #[error("requested {requested} values from blob of length {len}")]
    OutOfRange { requested: usize, len: usize },
}

/// One raw output tensor as produced by the inference engine.
///
/// `dims[0]` is the batch dimension. The remaining dimensions are
/// opaque here and only matter to the layer decoder.
#[derive(Clone, Debug)]
pub struct OutputBlob {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl OutputBlob {
    pub fn new(name: impl Into<String>, dims: Vec<usize>, data: Vec<f32>) -> Self {
        Self { name: name.into(), dims, data }
    }

    /// Number of samples along the batch dimension, at least 1.
    pub fn batch_size(&self) -> usize {
        self.dims.first().copied().filter(|&b| b > 0).unwrap_or(1)
    }

    /// Element count of a single batch sample.
    pub fn sample_len(&self) -> usize {
        self.data.len() / self.batch_size()
    }

    /// Mutable view of one batch sample.
    pub fn sample_mut(&mut self, batch: usize) -> Result<&mut [f32], BlobError> {
        let batches = self.batch_size();
        if batch >= batches {
            return Err(BlobError::BatchOutOfRange { batch, batches });
        }
        let sample_len = self.sample_len();
        let start = batch * sample_len;
        Ok(&mut self.data[start..start + sample_len])
    }

    /// Mutable view of the first `len` elements, used by layouts that
    /// carry their own batch id in every record.
    pub fn head_mut(&mut self, len: usize) -> Result<&mut [f32], BlobError> {
        if len > self.data.len() {
            return Err(BlobError::OutOfRange { requested: len, len: self.data.len() });
        }
        Ok(&mut self.data[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_views_follow_batch_dim() {
        let mut blob = OutputBlob::new("boxes", vec![2, 3], (0..6).map(|v| v as f32).collect());
        assert_eq!(blob.batch_size(), 2);
        assert_eq!(blob.sample_len(), 3);
        assert_eq!(blob.sample_mut(1).unwrap(), &[3.0, 4.0, 5.0]);
        assert!(matches!(
            blob.sample_mut(2),
            Err(BlobError::BatchOutOfRange { batch: 2, batches: 2 })
        ));
    }

    #[test]
    fn missing_batch_dim_counts_as_single_sample() {
        let mut blob = OutputBlob::new("boxes", Vec::new(), vec![1.0, 2.0]);
        assert_eq!(blob.batch_size(), 1);
        assert_eq!(blob.sample_mut(0).unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn head_view_is_bounds_checked() {
        let mut blob = OutputBlob::new("boxes", vec![1, 4], vec![0.0; 4]);
        assert_eq!(blob.head_mut(2).unwrap().len(), 2);
        assert!(blob.head_mut(5).is_err());
    }
}
