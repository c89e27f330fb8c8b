//! Hosted backend over its REST interface.
//!
//! Rows are addressed with PostgREST filters (`id=eq.<uuid>`). The guarded
//! status update filters on both id and the expected status and asks for the
//! updated rows back; an empty result means another writer got there first.
//!
//! The backend must hold at most one auto-generated rating per visit:
//!
//! ```sql
//! CREATE UNIQUE INDEX ratings_one_auto_per_visit
//!     ON ratings (visit_id) WHERE is_auto_generated;
//! ```
//!
//! The index is partial, so it cannot be named as a PostgREST `on_conflict`
//! target. A second auto-rating insert comes back as `409` and is treated as
//! already recorded.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{UpdateOutcome, VisitStore};
use crate::error::{Error, Result};
use crate::geofence::GeoPoint;
use crate::model::{
    CheckInMethod, NewRating, Rating, Visit, VisitFields, VisitId, VisitStatus,
};

const MAX_LOG_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &SecretString, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = api_key.expose_secret();
        let mut apikey = HeaderValue::from_str(key)
            .map_err(|_| Error::Config("remote key is not a valid header value".into()))?;
        apikey.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| Error::Config("remote key is not a valid header value".into()))?;
        bearer.set_sensitive(true);
        headers.insert("apikey", apikey);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}/rest/v1/{name}", self.base_url)
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
            debug!(status = status.as_u16(), body = %preview, "backend request failed");
            return Err(Error::from_status(status.as_u16(), preview));
        }
        serde_json::from_str(&body).map_err(|e| {
            Error::permanent(format!("unexpected response body from backend: {e}"))
        })
    }

    async fn expect_success(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
        debug!(status = status.as_u16(), body = %preview, "backend request failed");
        Err(Error::from_status(status.as_u16(), preview))
    }
}

/// A `visits` row as the backend stores it.
#[derive(Debug, Deserialize)]
struct VisitRow {
    id: VisitId,
    agency_id: String,
    caregiver_id: String,
    elder_id: String,
    scheduled_start: DateTime<Utc>,
    scheduled_end: DateTime<Utc>,
    actual_start: Option<DateTime<Utc>>,
    actual_end: Option<DateTime<Utc>>,
    status: VisitStatus,
    check_in_method: Option<CheckInMethod>,
    check_in_latitude: Option<f64>,
    check_in_longitude: Option<f64>,
    check_out_latitude: Option<f64>,
    check_out_longitude: Option<f64>,
    site_latitude: Option<f64>,
    site_longitude: Option<f64>,
    qr_token: Option<String>,
    notes: Option<String>,
    updated_at: DateTime<Utc>,
}

fn point(lat: Option<f64>, lon: Option<f64>) -> Option<GeoPoint> {
    Some(GeoPoint::new(lat?, lon?))
}

impl From<VisitRow> for Visit {
    fn from(row: VisitRow) -> Self {
        Visit {
            id: row.id,
            agency_id: row.agency_id,
            caregiver_id: row.caregiver_id,
            care_recipient_id: row.elder_id,
            scheduled_start: row.scheduled_start,
            scheduled_end: row.scheduled_end,
            actual_start: row.actual_start,
            actual_end: row.actual_end,
            status: row.status,
            check_in_method: row.check_in_method,
            check_in_location: point(row.check_in_latitude, row.check_in_longitude),
            check_out_location: point(row.check_out_latitude, row.check_out_longitude),
            site: point(row.site_latitude, row.site_longitude),
            qr_token: row.qr_token,
            notes: row.notes,
            updated_at: row.updated_at,
        }
    }
}

/// PATCH body for a status change: status, timestamp and any set fields.
fn update_body(status: VisitStatus, fields: &VisitFields, at: DateTime<Utc>) -> Value {
    let mut body = Map::new();
    body.insert("status".into(), json!(status));
    body.insert("updated_at".into(), json!(at));
    if let Some(t) = fields.actual_start {
        body.insert("actual_start".into(), json!(t));
    }
    if let Some(t) = fields.actual_end {
        body.insert("actual_end".into(), json!(t));
    }
    if let Some(m) = fields.check_in_method {
        body.insert("check_in_method".into(), json!(m));
    }
    if let Some(p) = fields.check_in_location {
        body.insert("check_in_latitude".into(), json!(p.lat));
        body.insert("check_in_longitude".into(), json!(p.lon));
    }
    if let Some(p) = fields.check_out_location {
        body.insert("check_out_latitude".into(), json!(p.lat));
        body.insert("check_out_longitude".into(), json!(p.lon));
    }
    if let Some(ref n) = fields.notes {
        body.insert("notes".into(), json!(n));
    }
    Value::Object(body)
}

#[derive(Debug, Deserialize)]
struct LinkedUserRow {
    user_id: Option<String>,
}

#[async_trait]
impl VisitStore for RestStore {
    async fn get_visit(&self, id: VisitId) -> Result<Option<Visit>> {
        let response = self
            .client
            .get(self.table("visits"))
            .query(&[("id", format!("eq.{id}")), ("select", "*".into())])
            .send()
            .await?;
        let rows: Vec<VisitRow> = Self::parse_response(response).await?;
        Ok(rows.into_iter().next().map(Visit::from))
    }

    async fn update_visit_status(
        &self,
        id: VisitId,
        expected: VisitStatus,
        new_status: VisitStatus,
        fields: &VisitFields,
    ) -> Result<UpdateOutcome> {
        let response = self
            .client
            .patch(self.table("visits"))
            .query(&[
                ("id", format!("eq.{id}")),
                ("status", format!("eq.{expected}")),
            ])
            .header("Prefer", "return=representation")
            .json(&update_body(new_status, fields, Utc::now()))
            .send()
            .await?;
        let rows: Vec<VisitRow> = Self::parse_response(response).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(UpdateOutcome::Committed(row.into())),
            None => {
                debug!(visit_id = %id, %expected, "guarded update matched no rows");
                Ok(UpdateOutcome::Conflict)
            }
        }
    }

    async fn insert_rating(&self, rating: &NewRating) -> Result<()> {
        let response = self
            .client
            .post(self.table("ratings"))
            .header("Prefer", "return=minimal")
            .json(rating)
            .send()
            .await?;
        if rating_already_recorded(response.status().as_u16(), rating) {
            debug!(visit_id = %rating.visit_id, "auto rating already recorded");
            return Ok(());
        }
        Self::expect_success(response).await
    }

    async fn find_auto_rating(&self, visit_id: VisitId) -> Result<Option<Rating>> {
        let response = self
            .client
            .get(self.table("ratings"))
            .query(&[
                ("visit_id", format!("eq.{visit_id}")),
                ("is_auto_generated", "eq.true".into()),
                ("limit", "1".into()),
            ])
            .send()
            .await?;
        let rows: Vec<Rating> = Self::parse_response(response).await?;
        Ok(rows.into_iter().next())
    }

    async fn get_linked_user_id(&self, care_recipient_id: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.table("elders"))
            .query(&[
                ("id", format!("eq.{care_recipient_id}")),
                ("select", "user_id".into()),
            ])
            .send()
            .await?;
        let rows: Vec<LinkedUserRow> = Self::parse_response(response).await?;
        Ok(rows.into_iter().next().and_then(|r| r.user_id))
    }
}

/// A unique-violation on an auto rating means an earlier attempt landed.
fn rating_already_recorded(status: u16, rating: &NewRating) -> bool {
    status == 409 && rating.is_auto_generated
}
