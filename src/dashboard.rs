//! Admin dashboard: leads, psychologists, patients and the marketing email
//! log, plus the headline numbers shown above them.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::registry::SupabaseRegistry;

/// Rows shown from the marketing email log.
pub const EMAIL_LOG_LIMIT: usize = 20;

/// Estado value of a psychologist currently taking patients.
pub const ACTIVE_STATUS: &str = "ACTIVO";

/// Lead source counted as a WhatsApp lead.
pub const WHATSAPP_SOURCE: &str = "whatsapp";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lead {
    pub id: serde_json::Value,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Psychologist {
    pub id: serde_json::Value,
    pub nombre: Option<String>,
    pub email: Option<String>,
    pub estado: Option<String>,
    pub modalidad: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Patient {
    pub id: serde_json::Value,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailLog {
    pub id: serde_json::Value,
    pub patient_email: Option<String>,
    pub email_subject: Option<String>,
    pub email_tema: Option<String>,
    pub sent_at: Option<String>,
    pub status: Option<String>,
}

/// Headline numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardMetrics {
    /// Leads plus patients who came in through the intake form.
    pub total_leads: usize,
    pub active_psychologists: usize,
    pub whatsapp_leads: usize,
    /// Patients registered through the intake form.
    pub tally_leads: usize,
}

impl DashboardMetrics {
    pub fn compute(
        leads: &[Lead],
        psychologists: &[Psychologist],
        patients: &[Patient],
    ) -> Self {
        Self {
            total_leads: leads.len() + patients.len(),
            active_psychologists: psychologists
                .iter()
                .filter(|p| p.estado.as_deref() == Some(ACTIVE_STATUS))
                .count(),
            whatsapp_leads: leads
                .iter()
                .filter(|l| l.source.as_deref() == Some(WHATSAPP_SOURCE))
                .count(),
            tally_leads: patients.len(),
        }
    }
}

/// A row together with its display date.
#[derive(Debug, Clone, Serialize)]
pub struct Dated<T> {
    #[serde(flatten)]
    pub row: T,
    /// `dd/mm/yyyy`, or `-` when the timestamp is missing.
    pub date: String,
}

fn dated<T>(rows: Vec<T>, timestamp: impl Fn(&T) -> Option<&str>) -> Vec<Dated<T>> {
    rows.into_iter()
        .map(|row| {
            let date = format_date(timestamp(&row).unwrap_or_default());
            Dated { row, date }
        })
        .collect()
}

/// Everything the dashboard renders.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub metrics: DashboardMetrics,
    pub leads: Vec<Dated<Lead>>,
    pub psychologists: Vec<Dated<Psychologist>>,
    pub patients: Vec<Dated<Patient>>,
    pub email_logs: Vec<Dated<EmailLog>>,
}

impl DashboardView {
    pub fn build(
        leads: Vec<Lead>,
        psychologists: Vec<Psychologist>,
        patients: Vec<Patient>,
        email_logs: Vec<EmailLog>,
    ) -> Self {
        let metrics = DashboardMetrics::compute(&leads, &psychologists, &patients);
        Self {
            metrics,
            leads: dated(leads, |r| r.created_at.as_deref()),
            psychologists: dated(psychologists, |r| r.created_at.as_deref()),
            patients: dated(patients, |r| r.created_at.as_deref()),
            email_logs: dated(email_logs, |r| r.sent_at.as_deref()),
        }
    }
}

/// Render a timestamp as `dd/mm/yyyy`.
///
/// Accepts RFC 3339, PostgREST's `timestamp without time zone` output and
/// bare dates. Anything else renders as `-`.
pub fn format_date(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "-".to_string();
    }
    let date = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.date()))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|dt| dt.date()))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"));
    match date {
        Ok(d) => d.format("%d/%m/%Y").to_string(),
        Err(_) => "-".to_string(),
    }
}

/// Loads the dashboard from the registry.
#[derive(Clone)]
pub struct DashboardService {
    registry: Arc<SupabaseRegistry>,
}

impl DashboardService {
    pub fn new(registry: Arc<SupabaseRegistry>) -> Self {
        Self { registry }
    }

    /// Fetch every table. A table that fails to load is shown empty.
    pub async fn load(&self) -> DashboardView {
        let tables = self.registry.tables().clone();
        let newest_first = ("order", "created_at.desc".to_string());

        let (leads, psychologists, patients, email_logs) = tokio::join!(
            self.rows::<Lead>(&tables.leads, vec![("select", "*".to_string()), newest_first.clone()]),
            self.rows::<Psychologist>(
                &tables.directory,
                vec![
                    ("select", "id,nombre,email,estado,modalidad,created_at".to_string()),
                    newest_first.clone(),
                ],
            ),
            self.rows::<Patient>(&tables.patients, vec![("select", "*".to_string()), newest_first]),
            self.rows::<EmailLog>(
                &tables.email_log,
                vec![
                    ("select", "*".to_string()),
                    ("order", "sent_at.desc".to_string()),
                    ("limit", EMAIL_LOG_LIMIT.to_string()),
                ],
            ),
        );

        DashboardView::build(leads, psychologists, patients, email_logs)
    }

    async fn rows<T: DeserializeOwned>(&self, table: &str, query: Vec<(&str, String)>) -> Vec<T> {
        match self.registry.select(table, &query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Dashboard table failed to load");
                Vec::new()
            }
        }
    }
}
