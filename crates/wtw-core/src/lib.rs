//! Core domain model for What to Watch opinions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "wtw-core";

pub const TITLE_MAX_CHARS: usize = 128;
pub const SOURCE_MAX_CHARS: usize = 256;
pub const ADDED_BY_MAX_CHARS: usize = 64;

/// File extensions accepted for images attached through the page form.
pub const ALLOWED_IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "bmp"];

/// Persisted movie opinion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Opinion {
    pub id: i64,
    pub title: String,
    pub text: String,
    pub source: Option<String>,
    /// Share links of attached images. Stored, but not part of the JSON shape.
    #[serde(skip_serializing)]
    pub images: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub added_by: Option<String>,
}

impl Opinion {
    /// Overwrite the fields present in `payload`, leaving the rest untouched.
    pub fn apply(&mut self, payload: &OpinionPayload) {
        if let Some(title) = &payload.title {
            self.title = title.clone();
        }
        if let Some(text) = &payload.text {
            self.text = text.clone();
        }
        if let Some(source) = &payload.source {
            self.source = source.clone();
        }
        if let Some(added_by) = &payload.added_by {
            self.added_by = added_by.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(
            &self.title,
            &self.text,
            self.source.as_deref(),
            self.added_by.as_deref(),
        )
    }
}

/// Insert contract for the store. Also the row shape of the bulk import CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NewOpinion {
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub added_by: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl NewOpinion {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(
            &self.title,
            &self.text,
            self.source.as_deref(),
            self.added_by.as_deref(),
        )
    }
}

/// JSON body accepted by the create and update endpoints. Absent keys stay `None`.
///
/// For the optional fields, `Some(None)` is an explicit `null`, which clears
/// the stored value on update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct OpinionPayload {
    pub title: Option<String>,
    pub text: Option<String>,
    #[serde(deserialize_with = "present")]
    pub source: Option<Option<String>>,
    #[serde(deserialize_with = "present")]
    pub added_by: Option<Option<String>>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl OpinionPayload {
    pub fn has_required_fields(&self) -> bool {
        self.title.is_some() && self.text.is_some()
    }

    pub fn into_new_opinion(self) -> Result<NewOpinion, ValidationError> {
        let (Some(title), Some(text)) = (self.title, self.text) else {
            return Err(ValidationError::MissingFields);
        };
        let new = NewOpinion {
            title,
            text,
            source: self.source.flatten(),
            added_by: self.added_by.flatten(),
            images: Vec::new(),
        };
        new.validate()?;
        Ok(new)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Request is missing required fields")]
    MissingFields,
    #[error("{}", summarize(.0))]
    Invalid(Vec<FieldError>),
}

impl ValidationError {
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            Self::MissingFields => &[],
            Self::Invalid(errors) => errors,
        }
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Field-level checks shared by the page form, the JSON API and updates.
pub fn validate_fields(
    title: &str,
    text: &str,
    source: Option<&str>,
    added_by: Option<&str>,
) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if title.trim().is_empty() {
        errors.push(required("title"));
    } else if title.chars().count() > TITLE_MAX_CHARS {
        errors.push(too_long("title", TITLE_MAX_CHARS));
    }
    if text.trim().is_empty() {
        errors.push(required("text"));
    }
    if source.is_some_and(|s| s.chars().count() > SOURCE_MAX_CHARS) {
        errors.push(too_long("source", SOURCE_MAX_CHARS));
    }
    if added_by.is_some_and(|s| s.chars().count() > ADDED_BY_MAX_CHARS) {
        errors.push(too_long("added_by", ADDED_BY_MAX_CHARS));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Invalid(errors))
    }
}

fn required(field: &'static str) -> FieldError {
    FieldError {
        field,
        message: "This field is required".to_string(),
    }
}

fn too_long(field: &'static str, max: usize) -> FieldError {
    FieldError {
        field,
        message: format!("Must be at most {max} characters"),
    }
}

/// Case-insensitive extension check against [`ALLOWED_IMAGE_EXTENSIONS`].
pub fn is_allowed_image(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| ALLOWED_IMAGE_EXTENSIONS.contains(&ext.as_str()))
}
