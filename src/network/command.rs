//! Playback commands sent to the audio server
//!
//! Each command is a small JSON POST to `/api/<name>`. The exchange uses the
//! same connector, retry and status-line rules as the audio stream itself.

use serde::Serialize;
use serde_json::json;

use super::client::{Connector, IngestOptions, IngestionSession};
use super::http::Request;
use crate::error::IngestFailure;

/// Server-side playback command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ServerCommand {
    Play { track: Option<String> },
    Pause,
    Stop,
    Volume { level: u8 },
    Next,
    Prev,
}

impl ServerCommand {
    pub fn path(&self) -> &'static str {
        match self {
            ServerCommand::Play { .. } => "/api/play",
            ServerCommand::Pause => "/api/pause",
            ServerCommand::Stop => "/api/stop",
            ServerCommand::Volume { .. } => "/api/volume",
            ServerCommand::Next => "/api/next",
            ServerCommand::Prev => "/api/prev",
        }
    }

    /// Build the POST request for this command
    pub fn request(&self, host: &str, port: u16) -> Request {
        let request = Request::post(host, port, self.path());
        match self {
            ServerCommand::Play { track: Some(track) } => request.with_json(&json!({ "track": track })),
            ServerCommand::Volume { level } => request.with_json(&json!({ "volume": level })),
            _ => request,
        }
    }
}

/// Server reply to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub status: u16,
    pub body: String,
}

impl<C: Connector + ?Sized> Connector for &mut C {
    type Stream = C::Stream;

    fn connect(&mut self) -> std::io::Result<Self::Stream> {
        (**self).connect()
    }

    fn peer(&self) -> String {
        (**self).peer()
    }
}

/// Send `command` and collect the reply body
pub fn send_command<C: Connector>(
    connector: &mut C,
    host: &str,
    port: u16,
    command: &ServerCommand,
    options: IngestOptions,
) -> Result<CommandResponse, IngestFailure> {
    tracing::info!(?command, "Sending server command");

    let mut session = IngestionSession::new(connector, command.request(host, port), options);
    let mut body = Vec::new();
    let report = session.run(&mut body)?;

    Ok(CommandResponse {
        status: report.status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::client::tests::{ScriptedConnector, Step};

    #[test]
    fn test_paths_and_bodies() {
        let bytes = ServerCommand::Play {
            track: Some("song.wav".to_string()),
        }
        .request("h", 1)
        .to_bytes();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        assert!(text.starts_with("POST /api/play HTTP/1.1\r\n"));
        assert!(text.ends_with("{\"track\":\"song.wav\"}"));

        let bytes = ServerCommand::Next.request("h", 1).to_bytes();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        assert!(text.starts_with("POST /api/next HTTP/1.1\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_send_command() {
        let mut connector = ScriptedConnector::new(vec![Step::Data(
            b"HTTP/1.1 200 OK\r\nContent-Length: 15\r\n\r\n{\"status\":\"ok\"}".to_vec(),
        )]);

        let response = send_command(
            &mut connector,
            "localhost",
            8000,
            &ServerCommand::Volume { level: 40 },
            IngestOptions::default(),
        )
        .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{\"status\":\"ok\"}");
        assert_eq!(connector.connects, 1);
    }

    #[test]
    fn test_command_rejected() {
        let mut connector = ScriptedConnector::new(vec![Step::Data(b"HTTP/1.1 400 Bad Request\r\n\r\n".to_vec())]);
        let err = send_command(&mut connector, "localhost", 8000, &ServerCommand::Pause, IngestOptions::default())
            .unwrap_err();
        assert!(matches!(err, IngestFailure::Http(_)));
    }
}
