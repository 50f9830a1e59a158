//! Face detection and embedding backends.
//!
//! Detection and encoding are separate traits so a deployment can pair any
//! detector with any encoder. Backends:
//! - `StubFaceDetector` / `StubFaceEncoder`: scripted output for tests and
//!   `stub://` runs
//! - `TractFaceDetector` / `TractFaceEncoder`: local ONNX models (feature: backend-tract)

mod backend;
mod backends;
mod result;

pub use backend::{FaceDetector, FaceEncoder};
pub use backends::{StubCalls, StubFaceDetector, StubFaceEncoder};
#[cfg(feature = "backend-tract")]
pub use backends::{TractFaceDetector, TractFaceEncoder};
pub use result::FaceBox;
