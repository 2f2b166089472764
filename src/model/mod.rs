pub mod batch;
pub mod error;
pub mod normalize;
pub mod recognition;
pub mod scoring;
pub mod staging;
pub mod submission;

pub use batch::{BatchEntry, BatchOrchestrator, BatchReport};
pub use error::{ErrorKind, OmrError};
pub use normalize::{normalize, CanonicalImage, NormalizeLimits};
pub use recognition::{RecognitionGateway, RecognitionOutcome, Recognized};
pub use scoring::{score, Grade, ScoreReport, ValidationRequest};
pub use staging::{StagedImage, Staging};
pub use submission::{ImageSource, MediaKind, Submission};
