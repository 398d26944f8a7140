use crate::error::{ApiError, FieldError};
use validator::Validate;

/// Runs `validator` rules and flattens every failure into a (field, message) pair.
pub fn validate<T: Validate>(value: &T) -> Result<(), ApiError> {
    let Err(errors) = value.validate() else {
        return Ok(());
    };

    let mut fields: Vec<FieldError> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, failures)| {
            failures.iter().map(move |failure| {
                let message = failure
                    .message
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| failure.code.to_string());
                FieldError::new(field.to_string(), message)
            })
        })
        .collect();
    fields.sort_by(|left, right| left.field.cmp(&right.field));
    Err(ApiError::InvalidFields(fields))
}
