//! Structural checks on a phase-2 submission, before any session or store
//! access. Violations are client errors.

use super::types::{
    ProtocolError, UploadSubmission, UploadedFile, MAX_UPLOAD_BYTES, UPLOAD_EXTENSION,
    UPLOAD_FIELD_NAME,
};

#[derive(Debug, Clone)]
pub struct UploadValidator {
    max_bytes: usize,
}

impl UploadValidator {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Validate the submission and hand back its single file
    pub fn validate(&self, submission: UploadSubmission) -> Result<UploadedFile, ProtocolError> {
        if let Some(err) = submission.transport_error {
            return Err(ProtocolError::UploadShape(format!("upload failed: {}", err)));
        }

        let mut files = submission.files;
        if files.len() != 1 {
            return Err(ProtocolError::UploadShape(format!(
                "expected exactly one file, got {}",
                files.len()
            )));
        }
        let file = files.remove(0);

        if file.field_name != UPLOAD_FIELD_NAME {
            return Err(ProtocolError::UploadShape(format!(
                "unexpected field name '{}'",
                file.field_name
            )));
        }

        if !has_zip_extension(&file.file_name) {
            return Err(ProtocolError::UploadShape(format!(
                "file '{}' is not a {} archive",
                file.file_name, UPLOAD_EXTENSION
            )));
        }

        if file.data.is_empty() {
            return Err(ProtocolError::UploadShape("empty file".to_string()));
        }

        if file.data.len() > self.max_bytes {
            return Err(ProtocolError::UploadShape(format!(
                "file too large: {} bytes (max: {})",
                file.data.len(),
                self.max_bytes
            )));
        }

        Ok(file)
    }
}

impl Default for UploadValidator {
    fn default() -> Self {
        Self::new(MAX_UPLOAD_BYTES)
    }
}

fn has_zip_extension(file_name: &str) -> bool {
    let ext_len = UPLOAD_EXTENSION.len();
    file_name.len() > ext_len
        && file_name.is_char_boundary(file_name.len() - ext_len)
        && file_name[file_name.len() - ext_len..].eq_ignore_ascii_case(UPLOAD_EXTENSION)
}
