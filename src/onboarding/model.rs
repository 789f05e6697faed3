//! Onboarding data models: the uploaded CV, the extracted profile, and the
//! fixed values the service attaches to every new psychologist.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

/// How the psychologist sees patients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Modality {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "presencial")]
    InPerson,
    #[default]
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl Modality {
    /// Read a free-form label. Case is ignored; blank or unrecognised labels
    /// fall back to the default so the user can correct them during review.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "online" | "virtual" => Self::Online,
            "presencial" | "in-person" | "in_person" | "in person" => Self::InPerson,
            _ => Self::default(),
        }
    }
}

impl<'de> Deserialize<'de> for Modality {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = Option::<String>::deserialize(deserializer)?;
        Ok(label.as_deref().map(Self::from_label).unwrap_or_default())
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::InPerson => write!(f, "presencial"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// A CV picked by the user. Moved into the extraction call and dropped
/// afterwards, whatever the outcome.
#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedDocument {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Structured fields returned by the extraction workflow.
///
/// Wire keys are the ones the workflow emits. Missing or `null` keys fall back
/// to empty values so the user can fill them in during review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedProfile {
    #[serde(rename = "nombre_completo", deserialize_with = "null_as_default")]
    pub full_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(rename = "telefono", deserialize_with = "null_as_default")]
    pub phone: String,
    #[serde(rename = "años_experiencia", deserialize_with = "lenient_years")]
    pub years_experience: u32,
    #[serde(rename = "especialidades", deserialize_with = "null_as_default")]
    pub specialties: Vec<String>,
    #[serde(rename = "modalidad", deserialize_with = "null_as_default")]
    pub modality: Modality,
    #[serde(rename = "sobre_mi", deserialize_with = "null_as_default")]
    pub bio: String,
    #[serde(rename = "formacion", deserialize_with = "null_as_default")]
    pub credentials: Vec<String>,
}

impl ExtractedProfile {
    /// The first required field that is blank, if any.
    pub fn missing_required(&self) -> Option<&'static str> {
        if self.full_name.trim().is_empty() {
            Some("nombre_completo")
        } else if self.email.trim().is_empty() {
            Some("email")
        } else {
            None
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Years of experience as the workflow reports them: integers, floats such as
/// `7.0`, or numeric text. Anything unreadable becomes zero.
fn lenient_years<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let years = match value {
        Some(serde_json::Value::Number(n)) => match n.as_u64() {
            Some(whole) => Some(u32::try_from(whole).unwrap_or(u32::MAX)),
            None => n.as_f64().and_then(whole_years),
        },
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok().and_then(whole_years),
        _ => None,
    };
    Ok(years.unwrap_or_default())
}

fn whole_years(value: f64) -> Option<u32> {
    // Float to int casts saturate.
    (value.is_finite() && value >= 0.0).then(|| value.floor() as u32)
}

/// Identifier the registry assigns to a persisted profile.
///
/// Registries hand out either integer keys or UUIDs; both are kept as text
/// and numeric ids go back over the wire as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read an id out of a JSON value, accepting numbers and non-empty strings.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(Self(s.trim().to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl Serialize for ProfileId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.parse::<i64>() {
            Ok(n) => serializer.serialize_i64(n),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for ProfileId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid profile id: {value}")))
    }
}

/// Values attached to every new profile. Not editable by the psychologist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileDefaults {
    /// Session length in minutes.
    pub session_duration: u32,
    /// Gap between sessions in minutes.
    pub buffer_time: u32,
    pub hourly_rate: u32,
    pub currency: String,
    pub is_active: bool,
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            session_duration: 30,
            buffer_time: 15,
            hourly_rate: 100,
            currency: "USD".to_string(),
            is_active: true,
        }
    }
}

/// Maximum CV size accepted by default (10 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Media type the extraction workflow understands.
pub const DEFAULT_ACCEPTED_MEDIA_TYPE: &str = "application/pdf";

/// Which documents may be sent to the extraction service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub accepted_media_type: String,
    /// Exclusive upper bound on the document size.
    pub max_bytes: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            accepted_media_type: DEFAULT_ACCEPTED_MEDIA_TYPE.to_string(),
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl UploadPolicy {
    /// Check a document against the policy.
    pub fn check(&self, document: &UploadedDocument) -> Result<(), ValidationError> {
        self.check_media_type(&document.content_type)?;
        if document.size() >= self.max_bytes {
            return Err(ValidationError::DocumentTooLarge {
                size: document.size(),
                limit: self.max_bytes,
            });
        }
        if document.bytes.is_empty() {
            return Err(ValidationError::EmptyDocument);
        }
        Ok(())
    }

    /// Media type parameters and case are ignored.
    pub fn check_media_type(&self, content_type: &str) -> Result<(), ValidationError> {
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        if media_type.eq_ignore_ascii_case(&self.accepted_media_type) {
            Ok(())
        } else {
            Err(ValidationError::UnsupportedMediaType {
                found: content_type.to_string(),
                expected: self.accepted_media_type.clone(),
            })
        }
    }
}
