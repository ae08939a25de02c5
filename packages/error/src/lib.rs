use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnsupportedAction,
    NotFound,
    SidecarUnavailable,
    ConfigInvalid,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:companion-gateway:error:invalid_request",
            Self::UnsupportedAction => "urn:companion-gateway:error:unsupported_action",
            Self::NotFound => "urn:companion-gateway:error:not_found",
            Self::SidecarUnavailable => "urn:companion-gateway:error:sidecar_unavailable",
            Self::ConfigInvalid => "urn:companion-gateway:error:config_invalid",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnsupportedAction => "Unsupported Action",
            Self::NotFound => "Not Found",
            Self::SidecarUnavailable => "Sidecar Unavailable",
            Self::ConfigInvalid => "Configuration Invalid",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnsupportedAction => 400,
            Self::NotFound => 404,
            Self::SidecarUnavailable => 503,
            Self::ConfigInvalid => 500,
        }
    }
}

/// RFC 7807 problem document; extensions are flattened to the top level.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unsupported action: {action}")]
    UnsupportedAction { action: String },
    #[error("not found: {resource}")]
    NotFound { resource: String },
    #[error("sidecar unavailable: {message}")]
    SidecarUnavailable { message: String },
    #[error("configuration invalid: {message}")]
    ConfigInvalid { message: String },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnsupportedAction { .. } => ErrorType::UnsupportedAction,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::SidecarUnavailable { .. } => ErrorType::SidecarUnavailable,
            Self::ConfigInvalid { .. } => ErrorType::ConfigInvalid,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::UnsupportedAction { action } => {
                extensions.insert("action".to_string(), Value::String(action.clone()));
            }
            Self::NotFound { resource } => {
                extensions.insert("resource".to_string(), Value::String(resource.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_urn_and_status() {
        let err = GatewayError::SidecarUnavailable {
            message: "startup timed out".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(
            problem.type_,
            "urn:companion-gateway:error:sidecar_unavailable"
        );
        assert_eq!(problem.status, 503);
        assert_eq!(
            problem.detail.as_deref(),
            Some("sidecar unavailable: startup timed out")
        );
    }

    #[test]
    fn problem_details_serialize_flat() {
        let err = GatewayError::UnsupportedAction {
            action: "reboot".to_string(),
        };
        let json = serde_json::to_value(err.to_problem_details()).unwrap();
        assert_eq!(json["status"], 400);
        assert_eq!(json["action"], "reboot");
    }
}
