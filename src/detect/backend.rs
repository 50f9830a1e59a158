use anyhow::Result;

use super::result::FaceBox;

/// Face detector backend.
///
/// Implementations treat the pixel slice as read-only and must not keep it
/// beyond the call.
pub trait FaceDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Find faces in an RGB24 frame.
    ///
    /// `upsample` trades speed for sensitivity to small faces: 0 is the fast
    /// pass, higher values look harder.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32, upsample: u32)
        -> Result<Vec<FaceBox>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Turns a detected face into a fixed-length embedding.
pub trait FaceEncoder: Send {
    fn name(&self) -> &'static str;

    fn encode(&mut self, pixels: &[u8], width: u32, height: u32, face: &FaceBox)
        -> Result<Vec<f32>>;
}
