//! Route authorization and caller extraction.
//!
//! Authentication itself happens in front of the gateway. That layer either
//! inserts a [`CallerIdentity`] into the request extensions, or forwards the
//! trusted `X-Auth-*` headers parsed here. Requests without either are anonymous.
//!
//! [`AuthGate`] evaluates a route's [`AuthRequirements`] in a fixed order
//! (signed-in, then org role, then server admin) and always completes before
//! any proxying or dispatch starts.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use gateway_common::{CallerIdentity, GatewayError, OrgRole};

use crate::api::ApiError;

pub const HEADER_USER_ID: &str = "x-auth-user-id";
pub const HEADER_ORG_ID: &str = "x-auth-org-id";
pub const HEADER_LOGIN: &str = "x-auth-login";
pub const HEADER_ORG_ROLE: &str = "x-auth-org-role";
pub const HEADER_SERVER_ADMIN: &str = "x-auth-server-admin";

/// Trusted identity headers; stripped before anything is forwarded to a backend.
pub const IDENTITY_HEADERS: &[&str] = &[
    HEADER_USER_ID,
    HEADER_ORG_ID,
    HEADER_LOGIN,
    HEADER_ORG_ROLE,
    HEADER_SERVER_ADMIN,
];

const DEFAULT_ORG_ID: i64 = 1;

/// Authorization requirements attached to a route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequirements {
    pub signed_in: bool,
    pub min_role: Option<OrgRole>,
    pub server_admin: bool,
}

/// One predicate of the gate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPredicate {
    SignedIn,
    OrgRoleAtLeast(OrgRole),
    ServerAdmin,
}

impl AuthRequirements {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn signed_in() -> Self {
        Self {
            signed_in: true,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: OrgRole) -> Self {
        self.min_role = Some(role);
        self
    }

    pub fn with_server_admin(mut self) -> Self {
        self.server_admin = true;
        self
    }

    /// The predicate chain, always in evaluation order.
    pub fn predicates(&self) -> Vec<AuthPredicate> {
        let mut chain = Vec::with_capacity(3);
        if self.signed_in {
            chain.push(AuthPredicate::SignedIn);
        }
        if let Some(role) = self.min_role {
            chain.push(AuthPredicate::OrgRoleAtLeast(role));
        }
        if self.server_admin {
            chain.push(AuthPredicate::ServerAdmin);
        }
        chain
    }

    /// Short human-readable summary, e.g. `signed-in,role>=Editor`.
    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .predicates()
            .into_iter()
            .map(|p| match p {
                AuthPredicate::SignedIn => "signed-in".to_string(),
                AuthPredicate::OrgRoleAtLeast(role) => format!("role>={}", role),
                AuthPredicate::ServerAdmin => "server-admin".to_string(),
            })
            .collect();
        if parts.is_empty() {
            "public".to_string()
        } else {
            parts.join(",")
        }
    }
}

impl AuthPredicate {
    fn check(self, caller: &CallerIdentity) -> Result<(), GatewayError> {
        match self {
            AuthPredicate::SignedIn if !caller.signed_in => {
                Err(GatewayError::Unauthorized("Unauthorized".into()))
            }
            AuthPredicate::OrgRoleAtLeast(role) if !caller.has_role(role) => Err(
                GatewayError::AccessDenied(format!("Permission denied: requires {} role", role)),
            ),
            AuthPredicate::ServerAdmin if !caller.is_server_admin => Err(
                GatewayError::AccessDenied("Permission denied: requires server admin".into()),
            ),
            _ => Ok(()),
        }
    }
}

pub struct AuthGate;

impl AuthGate {
    /// Run the predicate chain; the first failing predicate aborts the request.
    pub fn authorize(
        requirements: &AuthRequirements,
        caller: &CallerIdentity,
    ) -> Result<(), GatewayError> {
        requirements
            .predicates()
            .into_iter()
            .try_for_each(|predicate| predicate.check(caller))
    }
}

/// Extractor for the calling identity.
#[derive(Debug, Clone)]
pub struct Caller(pub CallerIdentity);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<CallerIdentity>() {
            return Ok(Caller(identity.clone()));
        }
        identity_from_headers(&parts.headers)
            .map(Caller)
            .map_err(ApiError::from)
    }
}

/// Parse the trusted identity headers. No `X-Auth-User-Id` means anonymous.
pub fn identity_from_headers(headers: &HeaderMap) -> Result<CallerIdentity, GatewayError> {
    let org_id = match header_str(headers, HEADER_ORG_ID)? {
        Some(raw) => parse_header(HEADER_ORG_ID, raw)?,
        None => DEFAULT_ORG_ID,
    };

    let Some(raw_user_id) = header_str(headers, HEADER_USER_ID)? else {
        return Ok(CallerIdentity::anonymous(org_id));
    };
    let user_id: i64 = parse_header(HEADER_USER_ID, raw_user_id)?;

    let org_role = match header_str(headers, HEADER_ORG_ROLE)? {
        Some(raw) => raw
            .parse::<OrgRole>()
            .map_err(GatewayError::Unauthorized)?,
        None => OrgRole::Viewer,
    };
    let is_server_admin = header_str(headers, HEADER_SERVER_ADMIN)?
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let login = header_str(headers, HEADER_LOGIN)?
        .unwrap_or_default()
        .to_string();

    Ok(CallerIdentity {
        user_id,
        org_id,
        login,
        org_role,
        is_server_admin,
        signed_in: true,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, GatewayError> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()))
            .map_err(|_| GatewayError::Unauthorized(format!("Invalid {} header", name))),
        None => Ok(None),
    }
}

fn parse_header<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::Unauthorized(format!("Invalid {} header", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};

    fn caller(role: OrgRole, admin: bool) -> CallerIdentity {
        CallerIdentity {
            user_id: 2,
            org_id: 1,
            login: "alice".into(),
            org_role: role,
            is_server_admin: admin,
            signed_in: true,
        }
    }

    #[test]
    fn predicates_follow_fixed_order() {
        let requirements = AuthRequirements::none()
            .with_server_admin()
            .with_role(OrgRole::Editor);
        let requirements = AuthRequirements {
            signed_in: true,
            ..requirements
        };
        assert_eq!(
            requirements.predicates(),
            vec![
                AuthPredicate::SignedIn,
                AuthPredicate::OrgRoleAtLeast(OrgRole::Editor),
                AuthPredicate::ServerAdmin,
            ]
        );
    }

    #[test]
    fn anonymous_caller_fails_signed_in_with_401() {
        let err = AuthGate::authorize(
            &AuthRequirements::signed_in().with_role(OrgRole::Admin),
            &CallerIdentity::anonymous(1),
        )
        .unwrap_err();
        // Signed-in is checked first, so the role failure is never reported.
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn insufficient_role_is_403() {
        let err = AuthGate::authorize(
            &AuthRequirements::signed_in().with_role(OrgRole::Editor),
            &caller(OrgRole::Viewer, false),
        )
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(err.to_string().contains("Editor"));
    }

    #[test]
    fn server_admin_required_even_for_org_admin() {
        let requirements = AuthRequirements::signed_in().with_server_admin();
        assert!(AuthGate::authorize(&requirements, &caller(OrgRole::Admin, false)).is_err());
        assert!(AuthGate::authorize(&requirements, &caller(OrgRole::Viewer, true)).is_ok());
    }

    #[test]
    fn empty_requirements_admit_anonymous() {
        let anonymous = CallerIdentity::anonymous(1);
        assert!(AuthGate::authorize(&AuthRequirements::none(), &anonymous).is_ok());
        assert_eq!(AuthRequirements::none().describe(), "public");
    }

    #[test]
    fn headers_produce_signed_in_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER_ID, HeaderValue::from_static("12"));
        headers.insert(HEADER_ORG_ID, HeaderValue::from_static("3"));
        headers.insert(HEADER_LOGIN, HeaderValue::from_static("bob"));
        headers.insert(HEADER_ORG_ROLE, HeaderValue::from_static("Editor"));
        headers.insert(HEADER_SERVER_ADMIN, HeaderValue::from_static("true"));

        let identity = identity_from_headers(&headers).unwrap();
        assert_eq!(identity.user_id, 12);
        assert_eq!(identity.org_id, 3);
        assert_eq!(identity.login, "bob");
        assert_eq!(identity.org_role, OrgRole::Editor);
        assert!(identity.is_server_admin);
        assert!(identity.signed_in);
    }

    #[test]
    fn missing_user_header_is_anonymous() {
        let identity = identity_from_headers(&HeaderMap::new()).unwrap();
        assert!(!identity.signed_in);
        assert_eq!(identity.org_id, 1);
    }

    #[test]
    fn malformed_user_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER_ID, HeaderValue::from_static("not-a-number"));
        let err = identity_from_headers(&headers).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
