// File-backed picker for headless runs

use async_trait::async_trait;
use std::path::PathBuf;

use super::{PhotoPicker, PickerError, PickerRequest, PickerResponse};

/// Picker that "selects" a preconfigured file. No file configured behaves
/// like a user dismissing the picker.
#[derive(Debug, Clone, Default)]
pub struct FilePicker {
    path: Option<PathBuf>,
}

impl FilePicker {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl PhotoPicker for FilePicker {
    async fn pick(&self, _request: &PickerRequest) -> Result<Option<PickerResponse>, PickerError> {
        Ok(self
            .path
            .as_ref()
            .map(|p| PickerResponse::from_location(p.to_string_lossy())))
    }
}
