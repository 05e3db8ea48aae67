use serde::{Deserialize, Serialize};

use crate::identity::OrgRole;

/// Reserved uid of the expression pseudo-datasource.
pub const EXPRESSION_DATASOURCE_UID: &str = "__expr__";

/// Reserved numeric id of the expression pseudo-datasource.
pub const EXPRESSION_DATASOURCE_ID: i64 = -100;

/// Reserved datasource name marking an expression node in a transform batch.
pub const EXPRESSION_DATASOURCE_NAME: &str = "__expr__";

/// A query's reference to a datasource, by any of id, uid or name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceRef {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ds_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DataSourceRef {
    pub fn by_uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            ..Self::default()
        }
    }

    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn expression() -> Self {
        Self {
            ds_type: Some(EXPRESSION_DATASOURCE_UID.to_string()),
            uid: Some(EXPRESSION_DATASOURCE_UID.to_string()),
            id: Some(EXPRESSION_DATASOURCE_ID),
            name: Some(EXPRESSION_DATASOURCE_NAME.to_string()),
        }
    }

    /// True when any identifier carries the reserved expression marker.
    pub fn is_expression(&self) -> bool {
        self.uid.as_deref() == Some(EXPRESSION_DATASOURCE_UID)
            || self.id == Some(EXPRESSION_DATASOURCE_ID)
            || self.name.as_deref() == Some(EXPRESSION_DATASOURCE_NAME)
    }

    pub fn is_empty(&self) -> bool {
        self.uid.as_deref().is_none_or(str::is_empty)
            && self.id.is_none()
            && self.name.as_deref().is_none_or(str::is_empty)
    }
}

impl std::fmt::Display for DataSourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(uid) = &self.uid {
            write!(f, "uid={}", uid)
        } else if let Some(id) = self.id {
            write!(f, "id={}", id)
        } else if let Some(name) = &self.name {
            write!(f, "name={}", name)
        } else {
            write!(f, "<empty>")
        }
    }
}

/// How clients reach a datasource: through the gateway, or directly from the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Proxy,
    Direct,
}

/// A datasource after resolution; immutable for the lifetime of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDataSource {
    pub id: i64,
    pub uid: String,
    pub name: String,
    /// Plugin id of the backend serving this datasource.
    #[serde(rename = "type")]
    pub ds_type: String,
    pub url: String,
    #[serde(default)]
    pub access: AccessMode,
    pub org_id: i64,
    /// Minimum org role needed to use the datasource.
    #[serde(default)]
    pub min_role: OrgRole,
}

impl ResolvedDataSource {
    pub fn matches(&self, reference: &DataSourceRef) -> bool {
        if let Some(uid) = reference.uid.as_deref().filter(|u| !u.is_empty()) {
            return self.uid == uid;
        }
        if let Some(id) = reference.id {
            return self.id == id;
        }
        if let Some(name) = reference.name.as_deref().filter(|n| !n.is_empty()) {
            return self.name == name;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prometheus() -> ResolvedDataSource {
        ResolvedDataSource {
            id: 3,
            uid: "prom-main".into(),
            name: "Prometheus".into(),
            ds_type: "prometheus".into(),
            url: "http://prom:9090".into(),
            access: AccessMode::Proxy,
            org_id: 1,
            min_role: OrgRole::Viewer,
        }
    }

    #[test]
    fn any_reserved_identifier_marks_an_expression() {
        assert!(DataSourceRef::by_uid("__expr__").is_expression());
        assert!(DataSourceRef::by_id(-100).is_expression());
        let by_name = DataSourceRef {
            name: Some("__expr__".into()),
            ..Default::default()
        };
        assert!(by_name.is_expression());
        assert!(!DataSourceRef::by_uid("prom-main").is_expression());
    }

    #[test]
    fn uid_takes_precedence_over_id() {
        let ds = prometheus();
        let reference = DataSourceRef {
            uid: Some("prom-main".into()),
            id: Some(99),
            ..Default::default()
        };
        assert!(ds.matches(&reference));
        assert!(ds.matches(&DataSourceRef::by_id(3)));
        assert!(!ds.matches(&DataSourceRef::by_id(4)));
        assert!(!ds.matches(&DataSourceRef::default()));
    }

    #[test]
    fn ref_deserializes_type_field() {
        let reference: DataSourceRef =
            serde_json::from_str(r#"{"type":"prometheus","uid":"abc"}"#).unwrap();
        assert_eq!(reference.ds_type.as_deref(), Some("prometheus"));
        assert_eq!(reference.uid.as_deref(), Some("abc"));
        assert!(reference.id.is_none());
    }
}
