use regex::Regex;
use serde_json::Value;

use crate::SchemaError;

pub const DEFAULT_CODE_TYPE: &str = "rhai";

/// Script bound to the schemas whose URL matches `path`.
#[derive(Clone, Debug)]
pub struct Extension {
    pub id: String,
    pub code_type: String,
    pub code: String,
    pub file: Option<String>,
    path: Option<Regex>,
}

impl Extension {
    pub fn new(id: impl Into<String>, code: impl Into<String>, path: Option<&str>) -> Result<Self, SchemaError> {
        Ok(Self {
            id: id.into(),
            code_type: DEFAULT_CODE_TYPE.into(),
            code: code.into(),
            file: None,
            path: path.filter(|p| !p.is_empty()).map(Regex::new).transpose()?,
        })
    }

    /// `file` is kept as given; the loader resolves and reads it.
    pub fn from_value(raw: &Value) -> Result<Self, SchemaError> {
        let get = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
        let id = get("id").ok_or_else(|| SchemaError::Invalid("extension id is required".into()))?;
        let mut ext = Self::new(id, get("code").unwrap_or_default(), get("path").as_deref())?;
        if let Some(code_type) = get("code_type").filter(|c| !c.is_empty()) {
            ext.code_type = code_type;
        }
        ext.file = get("file").filter(|f| !f.is_empty());
        if ext.code.is_empty() && ext.file.is_none() {
            return Err(SchemaError::Invalid(format!(
                "extension {} needs either code or file",
                ext.id
            )));
        }
        Ok(ext)
    }

    pub fn matches(&self, url: &str) -> bool {
        self.path.as_ref().map_or(true, |re| re.is_match(url))
    }

    pub fn path(&self) -> &str {
        self.path.as_ref().map_or("", Regex::as_str)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn path_regex_binds_to_urls() {
        let ext = Extension::from_value(&json!({"id": "net", "code": "1", "path": "/v2.0/net.*"})).unwrap();
        assert!(ext.matches("/v2.0/networks"));
        assert!(!ext.matches("/v2.0/subnets"));
        let all = Extension::from_value(&json!({"id": "all", "code": "1"})).unwrap();
        assert!(all.matches("/anything"));
        assert_eq!(all.code_type, DEFAULT_CODE_TYPE);
    }

    #[test]
    fn needs_code_or_file() {
        assert!(Extension::from_value(&json!({"id": "x"})).is_err());
        let ext = Extension::from_value(&json!({"id": "x", "file": "x.rhai"})).unwrap();
        assert_eq!(ext.file.as_deref(), Some("x.rhai"));
    }
}
