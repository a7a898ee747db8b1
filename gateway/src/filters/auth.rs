use crate::context::{Identity, RequestContext, Role};
use crate::errors::GatewayError;
use crate::filters::Filter;
use crate::routes::RouteDescriptor;
use http::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
pub const X_USER_ROLE: HeaderName = HeaderName::from_static("x-user-role");

/// Claims carried by the platform's access tokens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub exp: u64,
}

/// Verifies HS256 bearer tokens and forwards the caller's identity as `X-User-*` headers.
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Authenticator {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Public routes and upstream health probes need no token.
    pub fn is_exempt(route: &RouteDescriptor, path: &str) -> bool {
        !route.requires_auth || path.ends_with("/health")
    }

    pub fn verify(&self, token: &str) -> Result<Identity, GatewayError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            match e.kind() {
                ErrorKind::ExpiredSignature => GatewayError::Unauthenticated("Token has expired"),
                ErrorKind::InvalidSignature => {
                    GatewayError::Unauthenticated("Invalid token signature")
                }
                _ => GatewayError::Unauthenticated("Invalid token"),
            }
        })?;

        let claims = data.claims;
        Ok(Identity {
            subject_id: claims.id,
            email: claims.email,
            name: claims.name,
            role: claims.role,
            token: token.to_string(),
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

impl Filter for Authenticator {
    fn name(&self) -> &'static str {
        "authenticator"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        if Self::is_exempt(ctx.route()?, &ctx.path) {
            return Ok(());
        }

        let token = bearer_token(&ctx.headers)
            .ok_or(GatewayError::Unauthenticated("Missing bearer token"))?;
        let identity = self.verify(token)?;

        let email = HeaderValue::from_str(&identity.email)
            .map_err(|_| GatewayError::Unauthenticated("Invalid token"))?;
        ctx.headers
            .insert(X_USER_ID, HeaderValue::from(identity.subject_id));
        ctx.headers.insert(X_USER_EMAIL, email);
        ctx.headers
            .insert(X_USER_ROLE, HeaderValue::from_static(identity.role.as_str()));
        ctx.identity = Some(identity);

        Ok(())
    }
}
