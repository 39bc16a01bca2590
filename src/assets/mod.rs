pub mod folders;
pub mod uploads;

pub use folders::{FolderSelection, FolderTree};
pub use uploads::{Applied, FieldKey, UploadCoordinator, UploadError, UploadHandle, UploadOutcome};
