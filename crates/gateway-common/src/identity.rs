use serde::{Deserialize, Serialize};

/// Organization role of a caller. Ordering follows privilege: `Viewer < Editor < Admin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum OrgRole {
    #[default]
    Viewer,
    Editor,
    Admin,
}

impl std::fmt::Display for OrgRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrgRole::Viewer => write!(f, "Viewer"),
            OrgRole::Editor => write!(f, "Editor"),
            OrgRole::Admin => write!(f, "Admin"),
        }
    }
}

impl std::str::FromStr for OrgRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "viewer" => Ok(OrgRole::Viewer),
            "editor" => Ok(OrgRole::Editor),
            "admin" => Ok(OrgRole::Admin),
            _ => Err(format!(
                "Invalid org role '{}'. Valid values: Viewer, Editor, Admin",
                s
            )),
        }
    }
}

/// The authenticated (or anonymous) caller of a request.
///
/// Supplied by the authentication layer in front of the gateway and consumed
/// read-only. This is also the payload forwarded to plugin backends as the
/// trusted identity header, so the field names are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerIdentity {
    pub user_id: i64,
    pub org_id: i64,
    pub login: String,
    pub org_role: OrgRole,
    pub is_server_admin: bool,
    pub signed_in: bool,
}

impl CallerIdentity {
    /// A caller that presented no credentials.
    pub fn anonymous(org_id: i64) -> Self {
        Self {
            user_id: 0,
            org_id,
            login: String::new(),
            org_role: OrgRole::Viewer,
            is_server_admin: false,
            signed_in: false,
        }
    }

    pub fn has_role(&self, role: OrgRole) -> bool {
        self.org_role >= role
    }
}
