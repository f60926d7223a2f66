use crate::session::SessionManager;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the attendance capture daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    sessions: Arc<SessionManager>,
}

impl RollcallService {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Start a capture session; returns its id once the loop is spawned.
    async fn start_session(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_session requested");
        let id = self
            .sessions
            .start()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(id.to_string())
    }

    /// Stop the running session and return its report as JSON.
    async fn stop_session(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop_session requested");
        let report = self
            .sessions
            .stop()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Report of the most recently stopped session as JSON, or an error if
    /// none has been stopped since the daemon started.
    async fn last_report(&self) -> zbus::fdo::Result<String> {
        let report = self
            .sessions
            .last_report()
            .ok_or_else(|| zbus::fdo::Error::Failed("no session has been stopped yet".into()))?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return controller status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.sessions.status())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CaptureSettings;
    use crate::testing::{FakeCamera, FakeResources, Scene};
    use std::time::Duration;
    use zbus::connection::Builder;

    fn service() -> RollcallService {
        let resources = FakeResources::new(|| {
            Ok(FakeCamera::new(vec![Scene::Faces(vec![0, 3]), Scene::Faces(vec![1, 2])])
                .with_delay(Duration::from_millis(5)))
        });
        let settings = CaptureSettings {
            warmup_frames: 1,
            distance_threshold: Some(50.0),
            equalize: false,
            attendance_log: None,
        };
        RollcallService::new(Arc::new(SessionManager::new(
            Arc::new(resources),
            settings,
            Duration::from_secs(2),
        )))
    }

    /// Serve the interface on one end of a socket pair and return the client end.
    async fn connect(service: RollcallService) -> (zbus::Connection, zbus::Connection) {
        let (server, client) = tokio::net::UnixStream::pair().unwrap();
        let server = Builder::unix_stream(server)
            .server(zbus::Guid::generate())
            .unwrap()
            .p2p()
            .serve_at(OBJECT_PATH, service)
            .unwrap()
            .build();
        let client = Builder::unix_stream(client).p2p().build();
        tokio::try_join!(server, client).unwrap()
    }

    async fn call(conn: &zbus::Connection, method: &str) -> zbus::Result<String> {
        let reply = conn
            .call_method(None::<&str>, OBJECT_PATH, Some(BUS_NAME), method, &())
            .await?;
        reply.body().deserialize()
    }

    async fn status(conn: &zbus::Connection) -> serde_json::Value {
        serde_json::from_str(&call(conn, "Status").await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_stop_session_over_dbus() {
        let (_server, client) = connect(service()).await;

        let id = call(&client, "StartSession").await.unwrap();
        for _ in 0..500 {
            if status(&client).await["identities"].as_array().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report: serde_json::Value =
            serde_json::from_str(&call(&client, "StopSession").await.unwrap()).unwrap();
        assert_eq!(report["session_id"], id.as_str());
        assert_eq!(report["outcome"]["status"], "completed");
        assert_eq!(report["outcome"]["stopped_by"], "caller");
        assert_eq!(report["identities"], serde_json::json!(["S001", "S002"]));

        assert_eq!(status(&client).await["state"], "stopped");
        let again: serde_json::Value =
            serde_json::from_str(&call(&client, "LastReport").await.unwrap()).unwrap();
        assert_eq!(again["session_id"], id.as_str());

        // Stopping twice is an error reply, and the daemon accepts a new session.
        assert!(call(&client, "StopSession").await.is_err());
        call(&client, "StartSession").await.unwrap();
        call(&client, "StopSession").await.unwrap();
    }
}
