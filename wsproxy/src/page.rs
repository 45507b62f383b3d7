//! Minimal HTTP responses written straight to a local socket when the
//! gateway cannot be reached, so embedded app frames show something legible.

use http::StatusCode;

/// Interim response sent while the app inside the session is still starting.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    NotFound,
    Unauthorized,
    /// The app kept answering 500 after every retry.
    AppFailed,
    BadGateway,
    GatewayTimeout,
    Unexpected(StatusCode),
}

impl Page {
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::UNAUTHORIZED => Self::Unauthorized,
            StatusCode::INTERNAL_SERVER_ERROR => Self::AppFailed,
            StatusCode::BAD_GATEWAY => Self::BadGateway,
            StatusCode::GATEWAY_TIMEOUT => Self::GatewayTimeout,
            other => Self::Unexpected(other),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::AppFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Unexpected(status) => *status,
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::NotFound => "The session or the app was not found on the server.".to_string(),
            Self::Unauthorized => "The server rejected the proxy credentials.".to_string(),
            Self::AppFailed => "The app did not start in time. Try again later.".to_string(),
            Self::BadGateway => "The server could not reach the app.".to_string(),
            Self::GatewayTimeout => "The server did not respond in time.".to_string(),
            Self::Unexpected(status) => format!("Unexpected response code {}.", status.as_u16()),
        }
    }

    pub fn body(&self) -> String {
        let status = self.status();
        format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Server connection failed</title></head>\
             <body><h1>Server connection failed</h1><p>{}</p><p><small>{}</small></p></body></html>\n",
            self.detail(),
            status.as_u16(),
        )
    }

    /// Full response including the status line and headers.
    pub fn render(&self) -> Vec<u8> {
        let status = self.status();
        let body = self.body();
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n{}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
            mime::TEXT_HTML_UTF_8,
            body.len(),
            body,
        )
        .into_bytes()
    }
}
