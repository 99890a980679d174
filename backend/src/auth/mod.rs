// Acting user and per-field access control
//
// Authentication happens upstream; the gateway forwards the verified identity
// in `X-User-Id`, `X-User-Roles` and `X-User-Admin`.

pub mod fields;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};

use crate::error::AppError;

pub use fields::FieldMask;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLES_HEADER: &str = "x-user-roles";
pub const USER_ADMIN_HEADER: &str = "x-user-admin";

/// Identity of whoever is performing an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role_ids: Vec<String>,
    pub is_admin: bool,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role_ids: &[&str]) -> Self {
        Self {
            user_id: user_id.into(),
            role_ids: role_ids.iter().map(|r| r.to_string()).collect(),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role_ids: Vec::new(),
            is_admin: true,
        }
    }

    pub fn has_role(&self, role_id: &str) -> bool {
        self.role_ids.iter().any(|r| r == role_id)
    }

    fn from_parts(parts: &Parts) -> Result<Self, AppError> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?;

        let role_ids = header(USER_ROLES_HEADER)
            .map(|roles| {
                roles
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let is_admin = header(USER_ADMIN_HEADER)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        Ok(Self {
            user_id: user_id.to_string(),
            role_ids,
            is_admin,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Actor::from_parts(parts).map_err(IntoResponse::into_response)
    }
}
