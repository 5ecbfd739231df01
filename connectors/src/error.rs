use thiserror::Error;

/// Errors surfaced by the connector framework.
///
/// 404 on a single-item fetch is not represented here: `fetch_item` resolves
/// it to `Ok(None)`, every other non-2xx becomes one of these variants.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// 401 after the refresh attempt was exhausted or refresh is unsupported.
    #[error("authentication failed (status {status})")]
    AuthFailed { status: u16 },

    /// Any other non-2xx response, or a transport-level failure.
    #[error("request failed (status {status}): {message}")]
    RequestFailed { status: u16, message: String },

    /// The token refresh endpoint itself errored.
    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// A Google-native document could not be exported to text.
    #[error("export failed for {external_id}: {message}")]
    ExportFailed { external_id: String, message: String },

    /// A file body could not be downloaded.
    #[error("download failed for {external_id}: {message}")]
    DownloadFailed { external_id: String, message: String },

    /// The connector configuration or credential bag is incomplete.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The factory has no registration for the requested type.
    #[error("unknown connector type: {0}")]
    UnknownConnectorType(String),
}

impl ConnectorError {
    /// Machine-readable code for sync error records and admin UIs.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::AuthFailed { .. } => "AUTH_FAILED",
            ConnectorError::RequestFailed { .. } => "REQUEST_FAILED",
            ConnectorError::TokenRefreshFailed(_) => "TOKEN_REFRESH_FAILED",
            ConnectorError::ExportFailed { .. } => "EXPORT_FAILED",
            ConnectorError::DownloadFailed { .. } => "DOWNLOAD_FAILED",
            ConnectorError::Configuration(_) => "CONFIGURATION_ERROR",
            ConnectorError::UnknownConnectorType(_) => "UNKNOWN_CONNECTOR_TYPE",
        }
    }

    /// HTTP status carried by the error, where applicable.
    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectorError::AuthFailed { status } => Some(*status),
            ConnectorError::RequestFailed { status, .. } if *status > 0 => Some(*status),
            _ => None,
        }
    }

    /// Whether the error is a not-found response on a single resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectorError::RequestFailed { status: 404, .. })
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        ConnectorError::RequestFailed {
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: err.to_string(),
        }
    }
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;
