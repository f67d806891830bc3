//! Remote booking/metadata store client.
//!
//! The appliance depends on two operations, both idempotent by booking id:
//! advancing a booking's lifecycle status, and inserting a row describing
//! the uploaded video. The store is a PostgREST-style HTTP API; an
//! unconfigured store turns both into logged no-ops so a bench appliance
//! can run without network scaffolding.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::booking::BookingStatus;
use crate::config::{BookingStoreConfig, Config};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Row written to the `videos` collection after a verified upload
#[derive(Debug, Clone, Serialize)]
pub struct VideoRecord {
    pub booking_id: String,
    pub user_id: String,
    pub url: String,
    pub size_bytes: u64,
    pub duration_secs: Option<f64>,
    pub checksum_sha256: String,
}

#[derive(Debug, Serialize)]
struct StatusPatch<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<&'a str>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct BookingStoreClient {
    client: Client,
    config: BookingStoreConfig,
}

impl BookingStoreClient {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            config: config.booking_store.clone(),
        }
    }

    /// Check if the store is configured
    pub fn is_configured(&self) -> bool {
        !self.config.url.is_empty()
    }

    /// Advance a booking's status. The caller is responsible for only
    /// requesting monotone advances; the store applies whatever is sent.
    pub async fn update_booking_status(&self, booking_id: &str, status: BookingStatus) -> Result<()> {
        self.patch_status(booking_id, status, None).await
    }

    /// Terminal failure with the short human-readable reason that also
    /// lands in `metadata.json`.
    pub async fn mark_booking_failed(&self, booking_id: &str, reason: &str) -> Result<()> {
        self.patch_status(booking_id, BookingStatus::Failed, Some(reason))
            .await
    }

    async fn patch_status(
        &self,
        booking_id: &str,
        status: BookingStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        if !self.is_configured() {
            debug!(
                booking_id,
                status = status.as_str(),
                "Booking store not configured; skipping status update"
            );
            return Ok(());
        }

        let url = format!("{}/bookings", self.config.url.trim_end_matches('/'));
        let patch = StatusPatch {
            status: status.as_str(),
            failure_reason,
            updated_at: chrono::Utc::now(),
        };

        self.client
            .patch(&url)
            .query(&[("id", format!("eq.{booking_id}"))])
            .header("apikey", &self.config.key)
            .bearer_auth(&self.config.key)
            .json(&patch)
            .send()
            .await
            .context("Failed to send booking status update")?
            .error_for_status()
            .context("Booking status update returned error status")?;

        info!(booking_id, status = status.as_str(), "Booking status updated");
        Ok(())
    }

    /// Insert the uploaded-video row. Duplicate inserts for the same
    /// booking merge rather than error, so upload retries stay idempotent.
    pub async fn insert_video_metadata(&self, record: &VideoRecord) -> Result<()> {
        if !self.is_configured() {
            debug!(
                booking_id = %record.booking_id,
                "Booking store not configured; skipping video metadata insert"
            );
            return Ok(());
        }

        let url = format!("{}/videos", self.config.url.trim_end_matches('/'));
        self.client
            .post(&url)
            .header("apikey", &self.config.key)
            .bearer_auth(&self.config.key)
            .header("Prefer", "resolution=merge-duplicates")
            .json(record)
            .send()
            .await
            .context("Failed to send video metadata insert")?
            .error_for_status()
            .context("Video metadata insert returned error status")?;

        info!(
            booking_id = %record.booking_id,
            size_bytes = record.size_bytes,
            "Video metadata recorded"
        );
        Ok(())
    }
}
