use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};

use crate::detect::backend::{FaceDetector, FaceEncoder};
use crate::detect::result::FaceBox;
use crate::identity::EMBEDDING_DIM;

/// Call counters shared between a stub backend and its test.
#[derive(Debug, Default)]
pub struct StubCalls {
    fast: AtomicU64,
    boost: AtomicU64,
    encode: AtomicU64,
}

impl StubCalls {
    pub fn fast_passes(&self) -> u64 {
        self.fast.load(Ordering::Relaxed)
    }

    pub fn boost_passes(&self) -> u64 {
        self.boost.load(Ordering::Relaxed)
    }

    pub fn encodes(&self) -> u64 {
        self.encode.load(Ordering::Relaxed)
    }
}

/// Detector that reports a fixed set of faces.
///
/// Faces can be limited to boost passes to mimic small faces that only show
/// up when upsampling. The face list is shared, so a test can change it while
/// the pipeline runs.
#[derive(Clone, Default)]
pub struct StubFaceDetector {
    faces: Arc<Mutex<Vec<FaceBox>>>,
    boost_only: bool,
    calls: Arc<StubCalls>,
}

impl StubFaceDetector {
    /// Detector that never finds anything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_faces(faces: Vec<FaceBox>) -> Self {
        Self {
            faces: Arc::new(Mutex::new(faces)),
            ..Self::default()
        }
    }

    /// Only report faces when `upsample > 0`.
    pub fn boost_only(mut self) -> Self {
        self.boost_only = true;
        self
    }

    pub fn set_faces(&self, faces: Vec<FaceBox>) {
        *self.faces.lock().unwrap_or_else(PoisonError::into_inner) = faces;
    }

    pub fn calls(&self) -> Arc<StubCalls> {
        self.calls.clone()
    }
}

impl FaceDetector for StubFaceDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        _pixels: &[u8],
        width: u32,
        height: u32,
        upsample: u32,
    ) -> Result<Vec<FaceBox>> {
        if upsample == 0 {
            self.calls.fast.fetch_add(1, Ordering::Relaxed);
            if self.boost_only {
                return Ok(Vec::new());
            }
        } else {
            self.calls.boost.fetch_add(1, Ordering::Relaxed);
        }
        let faces = self.faces.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(faces.iter().map(|f| f.clamp_to(width, height)).collect())
    }
}

/// Encoder that returns the same embedding for every face.
#[derive(Clone)]
pub struct StubFaceEncoder {
    embedding: Arc<Mutex<Vec<f32>>>,
    calls: Arc<StubCalls>,
}

impl StubFaceEncoder {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding: Arc::new(Mutex::new(embedding)),
            calls: Arc::new(StubCalls::default()),
        }
    }

    pub fn set_embedding(&self, embedding: Vec<f32>) {
        *self.embedding.lock().unwrap_or_else(PoisonError::into_inner) = embedding;
    }

    pub fn calls(&self) -> Arc<StubCalls> {
        self.calls.clone()
    }
}

impl Default for StubFaceEncoder {
    fn default() -> Self {
        Self::new(vec![0.0; EMBEDDING_DIM])
    }
}

impl FaceEncoder for StubFaceEncoder {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn encode(
        &mut self,
        _pixels: &[u8],
        width: u32,
        height: u32,
        face: &FaceBox,
    ) -> Result<Vec<f32>> {
        self.calls.encode.fetch_add(1, Ordering::Relaxed);
        if face.right > width || face.bottom > height {
            return Err(anyhow!("face box {:?} outside {}x{} frame", face, width, height));
        }
        Ok(self
            .embedding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boost_only_detector_is_silent_on_fast_pass() {
        let mut detector = StubFaceDetector::with_faces(vec![FaceBox::new(0, 60, 60, 0)]).boost_only();
        let calls = detector.calls();

        assert!(detector.detect(&[], 100, 100, 0).unwrap().is_empty());
        assert_eq!(detector.detect(&[], 100, 100, 1).unwrap().len(), 1);
        assert_eq!(calls.fast_passes(), 1);
        assert_eq!(calls.boost_passes(), 1);
    }

    #[test]
    fn faces_are_clamped_to_frame() {
        let mut detector = StubFaceDetector::with_faces(vec![FaceBox::new(0, 500, 500, 0)]);
        let faces = detector.detect(&[], 100, 80, 0).unwrap();
        assert_eq!(faces, vec![FaceBox::new(0, 100, 80, 0)]);
    }

    #[test]
    fn encoder_returns_configured_embedding() {
        let mut encoder = StubFaceEncoder::new(vec![0.5; EMBEDDING_DIM]);
        let face = FaceBox::new(0, 10, 10, 0);
        let v = encoder.encode(&[], 10, 10, &face).unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
        assert!(encoder.encode(&[], 5, 5, &face).is_err());
        assert_eq!(encoder.calls().encodes(), 2);
    }
}
