//! Profile registry: psychologist records kept in Supabase, reached through
//! its PostgREST interface.
//!
//! The onboarding sequencer only sees the [`ProfileRegistry`] trait; the admin
//! routes and the calendar callback use the concrete [`SupabaseRegistry`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CollaboratorError, OnboardingError};
use crate::onboarding::model::{ExtractedProfile, Modality, ProfileDefaults, ProfileId};

const SERVICE: &str = "registry";

/// PostgreSQL unique_violation, as reported by PostgREST.
const UNIQUE_VIOLATION: &str = "23505";

/// Persisted psychologist records, keyed by email for uniqueness.
#[async_trait]
pub trait ProfileRegistry: Send + Sync {
    /// Whether a profile with this email is already registered.
    async fn email_exists(&self, email: &str) -> Result<bool, CollaboratorError>;

    /// Persist a new profile and return the id the registry assigned.
    async fn create_profile(&self, profile: &NewProfile) -> Result<ProfileId, CollaboratorError>;
}

/// Register a reviewed profile: refuse a taken email, then create the row with
/// the fixed defaults. Required fields are the caller's to check.
pub async fn register_profile(
    registry: &dyn ProfileRegistry,
    profile: &ExtractedProfile,
    defaults: &ProfileDefaults,
) -> Result<ProfileId, OnboardingError> {
    let email = profile.email.trim();
    if registry.email_exists(email).await? {
        return Err(OnboardingError::Conflict {
            email: email.to_string(),
        });
    }
    let row = NewProfile::from_reviewed(profile, defaults, Utc::now());
    Ok(registry.create_profile(&row).await?)
}

/// Where OAuth credentials for a linked calendar are stored.
#[async_trait]
pub trait CalendarLinkStore: Send + Sync {
    async fn upsert_calendar_link(&self, link: &CalendarLink) -> Result<(), CollaboratorError>;
}

/// Row written when a reviewed profile is submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProfile {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub specialties: Vec<String>,
    pub years_experience: u32,
    pub modality: Modality,
    pub bio: Option<String>,
    pub formacion: Vec<String>,
    pub session_duration: u32,
    pub buffer_time: u32,
    pub hourly_rate: u32,
    pub currency: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewProfile {
    /// Build the row from the reviewed fields plus the fixed defaults.
    pub fn from_reviewed(
        profile: &ExtractedProfile,
        defaults: &ProfileDefaults,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: profile.full_name.trim().to_string(),
            email: profile.email.trim().to_string(),
            phone: non_blank(&profile.phone),
            specialties: profile.specialties.clone(),
            years_experience: profile.years_experience,
            modality: profile.modality,
            bio: non_blank(&profile.bio),
            formacion: profile.credentials.clone(),
            session_duration: defaults.session_duration,
            buffer_time: defaults.buffer_time,
            hourly_rate: defaults.hourly_rate,
            currency: defaults.currency.clone(),
            is_active: defaults.is_active,
            created_at: now,
            updated_at: now,
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// OAuth credentials for a psychologist's Google Calendar.
#[derive(Debug, Clone, Serialize)]
pub struct CalendarLink {
    pub psychologist_id: ProfileId,
    pub google_email: String,
    pub google_calendar_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub sync_enabled: bool,
    pub last_sync_at: DateTime<Utc>,
}

/// Fields of the admin "load profile" form, as posted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryForm {
    pub nombre_completo: String,
    pub orientacion_clinica: String,
    /// Comma separated.
    pub especialidades: String,
    pub modalidad: String,
    pub zona: Option<String>,
    pub disponibilidad_general: String,
    pub frase_clave: String,
    pub mini_bio: String,
    /// Checkbox value; `"on"` when ticked.
    pub estado_membresia: Option<String>,
}

/// Row of the public psychologist directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub nombre_completo: String,
    pub orientacion_clinica: String,
    pub especialidades: Vec<String>,
    pub modalidad: String,
    pub zona: Option<String>,
    pub disponibilidad_general: String,
    pub frase_clave: String,
    pub mini_bio: String,
    pub estado_membresia: bool,
}

impl From<DirectoryForm> for DirectoryEntry {
    fn from(form: DirectoryForm) -> Self {
        let especialidades = form
            .especialidades
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        // Virtual-only practices have no physical area.
        let zona = if form.modalidad == "virtual" {
            None
        } else {
            form.zona.as_deref().and_then(non_blank)
        };
        Self {
            nombre_completo: form.nombre_completo.trim().to_string(),
            orientacion_clinica: form.orientacion_clinica,
            especialidades,
            modalidad: form.modalidad,
            zona,
            disponibilidad_general: form.disponibilidad_general,
            frase_clave: form.frase_clave,
            mini_bio: form.mini_bio,
            estado_membresia: form.estado_membresia.as_deref() == Some("on"),
        }
    }
}

/// Table names used by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTables {
    /// Profiles created by the onboarding wizard.
    pub profiles: String,
    /// Directory profiles loaded by admins; also the dashboard's psychologist list.
    pub directory: String,
    pub calendar_links: String,
    pub leads: String,
    pub patients: String,
    pub email_log: String,
}

impl Default for RegistryTables {
    fn default() -> Self {
        Self {
            profiles: "psychologists".to_string(),
            directory: "perfiles_psicologos".to_string(),
            calendar_links: "google_calendar_config".to_string(),
            leads: "patient_leads".to_string(),
            patients: "patients".to_string(),
            email_log: "email_marketing_log".to_string(),
        }
    }
}

/// PostgREST client for the Supabase project.
pub struct SupabaseRegistry {
    client: reqwest::Client,
    rest_url: Url,
    service_key: SecretString,
    tables: RegistryTables,
}

impl SupabaseRegistry {
    pub fn new(
        client: reqwest::Client,
        project_url: &Url,
        service_key: SecretString,
        tables: RegistryTables,
    ) -> Result<Self, CollaboratorError> {
        let rest_url = project_url
            .join("rest/v1/")
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))?;
        Ok(Self {
            client,
            rest_url,
            service_key,
            tables,
        })
    }

    pub fn tables(&self) -> &RegistryTables {
        &self.tables
    }

    fn request(&self, method: Method, table: &str) -> Result<RequestBuilder, CollaboratorError> {
        let url = self
            .rest_url
            .join(table)
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))?;
        let key = self.service_key.expose_secret();
        Ok(self
            .client
            .request(method, url)
            .header("apikey", key)
            .bearer_auth(key))
    }

    async fn send(request: RequestBuilder) -> Result<Response, CollaboratorError> {
        request
            .send()
            .await
            .map_err(|e| CollaboratorError::transport(SERVICE, e))
    }

    async fn error_from(resp: Response) -> CollaboratorError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = %status, body = %body, "Registry request failed");
        CollaboratorError::Status {
            service: SERVICE,
            status: status.as_u16(),
            body,
        }
    }

    /// `GET /rest/v1/{table}` with PostgREST query parameters.
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, CollaboratorError> {
        let resp = Self::send(self.request(Method::GET, table)?.query(query)).await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        resp.json::<Vec<T>>()
            .await
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))
    }

    /// Insert a row into the admin directory and return it as stored.
    pub async fn create_directory_entry(
        &self,
        entry: &DirectoryEntry,
    ) -> Result<serde_json::Value, CollaboratorError> {
        let request = self
            .request(Method::POST, &self.tables.directory)?
            .header("Prefer", "return=representation")
            .json(entry);
        let resp = Self::send(request).await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))?;
        Ok(first_row(body))
    }
}

/// PostgREST returns inserted rows as an array; single-object bodies are
/// accepted too.
fn first_row(body: serde_json::Value) -> serde_json::Value {
    match body {
        serde_json::Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        other => other,
    }
}

fn is_unique_violation(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::CONFLICT || body.contains(UNIQUE_VIOLATION)
}

#[async_trait]
impl ProfileRegistry for SupabaseRegistry {
    async fn email_exists(&self, email: &str) -> Result<bool, CollaboratorError> {
        let rows: Vec<serde_json::Value> = self
            .select(
                &self.tables.profiles,
                &[
                    ("select", "id".to_string()),
                    ("email", format!("eq.{email}")),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn create_profile(&self, profile: &NewProfile) -> Result<ProfileId, CollaboratorError> {
        let request = self
            .request(Method::POST, &self.tables.profiles)?
            .header("Prefer", "return=representation")
            .json(profile);
        let resp = Self::send(request).await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if is_unique_violation(status, &body) {
                return Err(CollaboratorError::Conflict {
                    email: profile.email.clone(),
                });
            }
            tracing::warn!(status = %status, body = %body, "Registry rejected new profile");
            return Err(CollaboratorError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))?;
        let id = first_row(body)
            .get("id")
            .and_then(ProfileId::from_json)
            .ok_or(CollaboratorError::MissingId { service: SERVICE })?;
        tracing::info!(profile_id = %id, email = %profile.email, "Profile registered");
        Ok(id)
    }
}

#[async_trait]
impl CalendarLinkStore for SupabaseRegistry {
    async fn upsert_calendar_link(&self, link: &CalendarLink) -> Result<(), CollaboratorError> {
        let request = self
            .request(Method::POST, &self.tables.calendar_links)?
            .query(&[("on_conflict", "psychologist_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(link);
        let resp = Self::send(request).await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;

    #[derive(Default)]
    struct MemoryRegistry {
        rows: Mutex<Vec<NewProfile>>,
    }

    #[async_trait]
    impl ProfileRegistry for MemoryRegistry {
        async fn email_exists(&self, email: &str) -> Result<bool, CollaboratorError> {
            Ok(self.rows.lock().unwrap().iter().any(|r| r.email == email))
        }

        async fn create_profile(&self, profile: &NewProfile) -> Result<ProfileId, CollaboratorError> {
            let mut rows = self.rows.lock().unwrap();
            rows.push(profile.clone());
            Ok(ProfileId::new(rows.len().to_string()))
        }
    }

    #[tokio::test]
    async fn register_profile_refuses_taken_email() {
        let registry = MemoryRegistry::default();
        let defaults = ProfileDefaults::default();

        let id = register_profile(&registry, &reviewed(), &defaults).await.unwrap();
        assert_eq!(id, ProfileId::new("1"));
        assert_eq!(registry.rows.lock().unwrap()[0].email, "ana@x.com");

        let err = register_profile(&registry, &reviewed(), &defaults).await.unwrap_err();
        assert!(matches!(err, OnboardingError::Conflict { ref email } if email == "ana@x.com"));
        assert_eq!(registry.rows.lock().unwrap().len(), 1);
    }

    fn reviewed() -> ExtractedProfile {
        ExtractedProfile {
            full_name: "  Ana Ruiz ".into(),
            email: " ana@x.com".into(),
            phone: String::new(),
            years_experience: 7,
            specialties: vec!["ansiedad".into()],
            modality: Modality::Online,
            bio: "Psicóloga clínica.".into(),
            credentials: vec!["UBA".into()],
        }
    }

    #[test]
    fn new_profile_carries_defaults_and_trims() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let row = NewProfile::from_reviewed(&reviewed(), &ProfileDefaults::default(), now);
        assert_eq!(row.name, "Ana Ruiz");
        assert_eq!(row.email, "ana@x.com");
        assert_eq!(row.phone, None);
        assert_eq!(row.bio.as_deref(), Some("Psicóloga clínica."));
        assert_eq!(row.session_duration, 30);
        assert_eq!(row.buffer_time, 15);
        assert_eq!(row.hourly_rate, 100);
        assert_eq!(row.currency, "USD");
        assert!(row.is_active);
        assert_eq!(row.created_at, now);
    }

    #[test]
    fn new_profile_wire_shape() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let row = NewProfile::from_reviewed(&reviewed(), &ProfileDefaults::default(), now);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["modality"], "online");
        assert_eq!(json["formacion"], serde_json::json!(["UBA"]));
        assert_eq!(json["phone"], serde_json::Value::Null);
        assert_eq!(json["created_at"], "2026-03-01T12:00:00Z");
    }

    #[test]
    fn directory_form_splits_specialties_and_reads_checkbox() {
        let entry = DirectoryEntry::from(DirectoryForm {
            nombre_completo: "Lic. Ana López".into(),
            especialidades: "ansiedad, depresión ,, pareja".into(),
            modalidad: "presencial".into(),
            zona: Some("Palermo".into()),
            estado_membresia: Some("on".into()),
            ..Default::default()
        });
        assert_eq!(entry.especialidades, vec!["ansiedad", "depresión", "pareja"]);
        assert_eq!(entry.zona.as_deref(), Some("Palermo"));
        assert!(entry.estado_membresia);
    }

    #[test]
    fn virtual_directory_entries_drop_zone() {
        let entry = DirectoryEntry::from(DirectoryForm {
            modalidad: "virtual".into(),
            zona: Some("Palermo".into()),
            ..Default::default()
        });
        assert_eq!(entry.zona, None);
        assert!(!entry.estado_membresia);
        assert!(entry.especialidades.is_empty());
    }

    #[test]
    fn first_row_unwraps_arrays() {
        let row = first_row(serde_json::json!([{ "id": 1 }, { "id": 2 }]));
        assert_eq!(row["id"], 1);
        let row = first_row(serde_json::json!({ "id": 3 }));
        assert_eq!(row["id"], 3);
    }

    #[test]
    fn unique_violation_detection() {
        assert!(is_unique_violation(reqwest::StatusCode::CONFLICT, ""));
        assert!(is_unique_violation(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"code":"23505","message":"duplicate key"}"#
        ));
        assert!(!is_unique_violation(reqwest::StatusCode::BAD_REQUEST, "{}"));
    }
}
