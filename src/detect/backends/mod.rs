pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubCalls, StubFaceDetector, StubFaceEncoder};

#[cfg(feature = "backend-tract")]
pub use tract::{TractFaceDetector, TractFaceEncoder};
