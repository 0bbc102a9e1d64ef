use uuid::Uuid;

use crate::error::ApiError;

/// Maximum question length
const MAX_QUESTION_LENGTH: usize = 2000;

/// Validate a narration request
pub fn validate_narration_request(
    question: &str,
    images: &[String],
    max_images: usize,
) -> Result<(), ApiError> {
    if question.trim().is_empty() {
        return Err(ApiError::InvalidInput("Question cannot be empty".to_string()));
    }
    if question.chars().count() > MAX_QUESTION_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Question too long (max {} characters)",
            MAX_QUESTION_LENGTH
        )));
    }

    if images.is_empty() {
        return Err(ApiError::InvalidInput(
            "At least one image is required".to_string(),
        ));
    }
    if images.len() > max_images {
        return Err(ApiError::InvalidInput(format!(
            "Too many images (max {})",
            max_images
        )));
    }
    if let Some(i) = images.iter().position(|img| img.trim().is_empty()) {
        return Err(ApiError::InvalidInput(format!("Image {} is empty", i)));
    }

    Ok(())
}

/// Validate a session id taken from the URL
pub fn validate_session_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id)
        .map_err(|_| ApiError::InvalidInput(format!("Invalid session id: {}", id)))
}
