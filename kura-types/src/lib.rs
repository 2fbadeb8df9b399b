use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Category attached to every failure the resource pipeline reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ResourceProblem {
    InternalServerError,
    WrongQuery,
    WrongData,
    NotFound,
    DeleteFailed,
    CreateFailed,
    UpdateFailed,
    Unauthorized,
    Forbidden,
    ForeignKeyFailed,
}

impl ResourceProblem {
    pub const ALL: [ResourceProblem; 10] = [
        ResourceProblem::InternalServerError,
        ResourceProblem::WrongQuery,
        ResourceProblem::WrongData,
        ResourceProblem::NotFound,
        ResourceProblem::DeleteFailed,
        ResourceProblem::CreateFailed,
        ResourceProblem::UpdateFailed,
        ResourceProblem::Unauthorized,
        ResourceProblem::Forbidden,
        ResourceProblem::ForeignKeyFailed,
    ];

    pub fn status_code(self) -> u16 {
        match self {
            ResourceProblem::InternalServerError => 500,
            ResourceProblem::WrongQuery
            | ResourceProblem::WrongData
            | ResourceProblem::ForeignKeyFailed => 400,
            ResourceProblem::NotFound => 404,
            ResourceProblem::DeleteFailed
            | ResourceProblem::CreateFailed
            | ResourceProblem::UpdateFailed => 409,
            ResourceProblem::Unauthorized => 401,
            ResourceProblem::Forbidden => 403,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceProblem::InternalServerError => "InternalServerError",
            ResourceProblem::WrongQuery => "WrongQuery",
            ResourceProblem::WrongData => "WrongData",
            ResourceProblem::NotFound => "NotFound",
            ResourceProblem::DeleteFailed => "DeleteFailed",
            ResourceProblem::CreateFailed => "CreateFailed",
            ResourceProblem::UpdateFailed => "UpdateFailed",
            ResourceProblem::Unauthorized => "Unauthorized",
            ResourceProblem::Forbidden => "Forbidden",
            ResourceProblem::ForeignKeyFailed => "ForeignKeyFailed",
        }
    }

    /// Accepts either the problem name or its ordinal, the two forms scripts use.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => Self::ALL.iter().copied().find(|p| p.name() == name),
            Value::Number(n) => n
                .as_u64()
                .and_then(|i| Self::ALL.get(i as usize).copied()),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed exception raised by an extension handler.
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionInfo {
    pub name: String,
    pub message: String,
    pub code: Option<u16>,
    pub problem: Option<ResourceProblem>,
    pub inner: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            problem: None,
            inner: None,
        }
    }

    pub fn custom(message: impl Into<String>, code: u16) -> Self {
        Self {
            code: Some(code),
            ..Self::new("CustomException", message)
        }
    }

    /// Reads the map form stored under `context.exception`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let name = obj.get("name")?.as_str()?.to_string();
        let message = match obj.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let code = obj
            .get("code")
            .and_then(Value::as_f64)
            .filter(|c| *c >= 0.0 && *c <= u16::MAX as f64)
            .map(|c| c as u16);
        let problem = obj.get("problem").and_then(ResourceProblem::from_value);
        let inner = obj
            .get("inner_exception")
            .and_then(ExceptionInfo::from_value)
            .map(Box::new);
        Some(Self {
            name,
            message,
            code,
            problem,
            inner,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("name".into(), json!(self.name));
        obj.insert("message".into(), json!(self.message));
        if let Some(code) = self.code {
            obj.insert("code".into(), json!(code));
        }
        if let Some(problem) = self.problem {
            obj.insert("problem".into(), json!(problem.name()));
        }
        if let Some(inner) = &self.inner {
            obj.insert("inner_exception".into(), inner.to_value());
        }
        Value::Object(obj)
    }

    /// HTTP status an exception surfaces as when no hook translated it.
    pub fn status_code(&self) -> u16 {
        match self.name.as_str() {
            "CustomException" | "NotFoundException" | "TimeOutException" => {
                self.code.unwrap_or(400)
            }
            "ResourceException" => self.problem.map(|p| p.status_code()).unwrap_or(400),
            "ExtensionException" => self.inner.as_ref().map(|i| i.status_code()).unwrap_or(400),
            _ => 400,
        }
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.message)
    }
}

/// Failure reported by the resource pipeline.
#[derive(Clone, Debug, Error)]
pub enum ResourceError {
    #[error("{message}")]
    Problem {
        problem: ResourceProblem,
        message: String,
    },
    #[error("extension exception: {0}")]
    Extension(ExceptionInfo),
    /// An extension failed to run; never retried.
    #[error("{0}")]
    Script(String),
}

impl ResourceError {
    pub fn new(problem: ResourceProblem, message: impl Into<String>) -> Self {
        ResourceError::Problem {
            problem,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ResourceProblem::InternalServerError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ResourceProblem::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ResourceProblem::Unauthorized, message)
    }

    pub fn wrong_data(message: impl Into<String>) -> Self {
        Self::new(ResourceProblem::WrongData, message)
    }

    pub fn wrong_query(message: impl Into<String>) -> Self {
        Self::new(ResourceProblem::WrongQuery, message)
    }

    pub fn problem(&self) -> ResourceProblem {
        match self {
            ResourceError::Problem { problem, .. } => *problem,
            ResourceError::Extension(info) => info
                .problem
                .unwrap_or(ResourceProblem::InternalServerError),
            ResourceError::Script(_) => ResourceProblem::InternalServerError,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ResourceError::Problem { message, .. } => message.clone(),
            ResourceError::Extension(info) => info.message.clone(),
            ResourceError::Script(message) => message.clone(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ResourceError::Problem { problem, .. } => problem.status_code(),
            ResourceError::Extension(info) => info.status_code(),
            ResourceError::Script(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_status_codes() {
        assert_eq!(ResourceProblem::WrongQuery.status_code(), 400);
        assert_eq!(ResourceProblem::ForeignKeyFailed.status_code(), 400);
        assert_eq!(ResourceProblem::NotFound.status_code(), 404);
        assert_eq!(ResourceProblem::UpdateFailed.status_code(), 409);
        assert_eq!(ResourceProblem::Unauthorized.status_code(), 401);
        assert_eq!(ResourceProblem::Forbidden.status_code(), 403);
        assert_eq!(ResourceProblem::InternalServerError.status_code(), 500);
    }

    #[test]
    fn problem_from_name_or_ordinal() {
        assert_eq!(
            ResourceProblem::from_value(&json!("NotFound")),
            Some(ResourceProblem::NotFound)
        );
        assert_eq!(
            ResourceProblem::from_value(&json!(7)),
            Some(ResourceProblem::Unauthorized)
        );
        assert_eq!(ResourceProblem::from_value(&json!("Nope")), None);
    }

    #[test]
    fn custom_exception_map_shape() {
        let info = ExceptionInfo::custom("boom", 390);
        assert_eq!(
            info.to_value(),
            json!({"name": "CustomException", "message": "boom", "code": 390})
        );
        assert_eq!(ExceptionInfo::from_value(&info.to_value()), Some(info));
    }

    #[test]
    fn exception_status_unwraps_inner() {
        let inner = ExceptionInfo {
            problem: Some(ResourceProblem::NotFound),
            ..ExceptionInfo::new("ResourceException", "gone")
        };
        let outer = ExceptionInfo {
            inner: Some(Box::new(inner)),
            ..ExceptionInfo::new("ExtensionException", "wrapped")
        };
        assert_eq!(outer.status_code(), 404);
        assert_eq!(ExceptionInfo::new("BaseException", "x").status_code(), 400);
        assert_eq!(ExceptionInfo::custom("teapot", 418).status_code(), 418);
    }

    #[test]
    fn script_failures_are_internal() {
        let err = ResourceError::Script("database is locked".into());
        assert_eq!(err.problem(), ResourceProblem::InternalServerError);
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.message(), "database is locked");
        assert_eq!(err.to_string(), "database is locked");
    }
}
