use crate::service::{FaceFinderService, ServiceError};
use facefinder_core::UploadMode;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facefinder.FaceFinder1";
pub const OBJECT_PATH: &str = "/org/facefinder/FaceFinder1";

/// D-Bus interface for the FaceFinder daemon.
///
/// Bus name: org.facefinder.FaceFinder1
/// Object path: /org/facefinder/FaceFinder1
///
/// Structured replies are JSON strings.
pub struct FaceFinderInterface {
    service: Arc<FaceFinderService>,
}

impl FaceFinderInterface {
    pub fn new(service: Arc<FaceFinderService>) -> Self {
        Self { service }
    }
}

fn failed(err: ServiceError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding reply: {e}")))
}

#[interface(name = "org.facefinder.FaceFinder1")]
impl FaceFinderInterface {
    async fn create_session(&self) -> zbus::fdo::Result<String> {
        json(&self.service.create_session().await.map_err(failed)?)
    }

    async fn load_session(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session = session_id, "load_session requested");
        json(&self.service.load_session(session_id).await.map_err(failed)?)
    }

    async fn list_sessions(&self, limit: u32) -> zbus::fdo::Result<String> {
        json(&self.service.list_sessions(limit as usize).await.map_err(failed)?)
    }

    /// Each photo is a (filename, bytes) pair. `replace` discards the current photo set first.
    async fn upload_photos(
        &self,
        session_id: &str,
        photos: Vec<(String, Vec<u8>)>,
        replace: bool,
    ) -> zbus::fdo::Result<String> {
        let mode = if replace { UploadMode::Replace } else { UploadMode::Append };
        json(&self.service.upload_photos(session_id, photos, mode).await.map_err(failed)?)
    }

    async fn set_threshold(&self, session_id: &str, threshold: f64) -> zbus::fdo::Result<String> {
        json(&self.service.set_threshold(session_id, threshold).await.map_err(failed)?)
    }

    async fn capture_target(&self, session_id: &str, image: Vec<u8>, label: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session = session_id, label, bytes = image.len(), "capture_target requested");
        json(&self.service.capture_target(session_id, image, label).await.map_err(failed)?)
    }

    async fn capture_target_from_camera(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session = session_id, "camera capture requested");
        json(&self.service.capture_target_from_camera(session_id).await.map_err(failed)?)
    }

    async fn run_match(&self, session_id: &str) -> zbus::fdo::Result<String> {
        json(&self.service.run_match(session_id).await.map_err(failed)?)
    }

    async fn cancel_match(&self, session_id: &str) -> bool {
        self.service.cancel_match(session_id).await
    }

    async fn progress(&self, session_id: &str) -> zbus::fdo::Result<String> {
        json(&self.service.progress(session_id).await.map_err(failed)?)
    }

    async fn results(&self, session_id: &str) -> zbus::fdo::Result<String> {
        json(&self.service.results(session_id).await.map_err(failed)?)
    }

    /// Zip archive of the matched photos.
    async fn export_archive(&self, session_id: &str) -> zbus::fdo::Result<Vec<u8>> {
        self.service.export_archive(session_id).await.map_err(failed)
    }

    async fn reset(&self, session_id: &str) -> zbus::fdo::Result<String> {
        json(&self.service.reset(session_id).await.map_err(failed)?)
    }

    async fn history(&self, session_id: &str) -> zbus::fdo::Result<String> {
        json(&self.service.history(session_id).await.map_err(failed)?)
    }

    async fn delete_session(&self, session_id: &str) -> zbus::fdo::Result<bool> {
        self.service.delete_session(session_id).await.map_err(failed)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        json(&self.service.status().await)
    }
}
