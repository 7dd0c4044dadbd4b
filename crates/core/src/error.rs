/// Result alias that carries the custom [`BeatlightError`] type.
pub type Result<T> = std::result::Result<T, BeatlightError>;

/// Common error type for the core crate.
///
/// Topic overflow and receive timeouts are deliberately absent: they are
/// steady-state outcomes reported through `bool`/`Option` returns.
#[derive(Debug, thiserror::Error)]
pub enum BeatlightError {
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// An argument was rejected before any work was done.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The ADC collaborator reported a fault.
    #[error("adc fault: {0}")]
    Adc(#[from] AdcError),
    /// The FFT backend could not plan or run a transform.
    #[error("fft failure: {0}")]
    Fft(String),
    /// JSON (de)serialisation of configuration or reports failed.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl From<realfft::FftError> for BeatlightError {
    fn from(value: realfft::FftError) -> Self {
        Self::Fft(value.to_string())
    }
}

/// Faults reported by an [`AdcDriver`](crate::sampling::AdcDriver).
///
/// The payload is the driver's native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdcError {
    #[error("peripheral not ready ({0})")]
    NotReady(i32),
    #[error("read failed ({0})")]
    Read(i32),
    #[error("conversion to physical units failed ({0})")]
    Conversion(i32),
}
