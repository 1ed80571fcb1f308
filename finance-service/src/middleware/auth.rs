use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::services::{Claims, Role, TokenService};

/// Require a valid bearer token and attach its claims to the request.
pub async fn auth_middleware(
    State(tokens): State<TokenService>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?;

    let claims = tokens.validate(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
    })?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Authenticated caller. Every tenant query is scoped to `company_id`.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub role: Role,
}

impl AuthContext {
    pub fn require_admin(&self) -> Result<(), AppError> {
        match self.role {
            Role::Admin | Role::SuperAdmin => Ok(()),
            Role::Member => Err(AppError::Forbidden(anyhow::anyhow!(
                "Admin role required"
            ))),
        }
    }

    pub fn require_super_admin(&self) -> Result<(), AppError> {
        match self.role {
            Role::SuperAdmin => Ok(()),
            _ => Err(AppError::Forbidden(anyhow::anyhow!(
                "Super admin role required"
            ))),
        }
    }
}

impl From<&Claims> for AuthContext {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub,
            company_id: claims.company_id,
            role: claims.role,
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .map(AuthContext::from)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Not authenticated")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware::from_fn_with_state, routing::get, Router};
    use secrecy::Secret;
    use tower::ServiceExt;

    async fn whoami(auth: AuthContext) -> String {
        auth.company_id.to_string()
    }

    fn app(tokens: TokenService) -> Router {
        Router::new()
            .route("/", get(whoami))
            .route_layer(from_fn_with_state(tokens, auth_middleware))
    }

    fn tokens() -> TokenService {
        TokenService::new(&Secret::new("middleware-secret".to_string()))
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let response = app(tokens())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_token_is_401() {
        let response = app(tokens())
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(header::AUTHORIZATION, "Bearer not.a.jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_reaches_handler() {
        let tokens = tokens();
        let company = Uuid::new_v4();
        let token = tokens
            .issue(Uuid::new_v4(), company, Role::Member, chrono::Duration::minutes(5))
            .unwrap();

        let response = app(tokens)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn role_checks() {
        let ctx = |role| AuthContext {
            user_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            role,
        };
        assert!(ctx(Role::Member).require_admin().is_err());
        assert!(ctx(Role::Admin).require_admin().is_ok());
        assert!(ctx(Role::Admin).require_super_admin().is_err());
        assert!(ctx(Role::SuperAdmin).require_super_admin().is_ok());
    }
}
