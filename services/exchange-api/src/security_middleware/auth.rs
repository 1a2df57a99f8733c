use crate::errors::ApiError;
use actix_web::{
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    Error, FromRequest, HttpMessage, HttpRequest,
};
use coin_ledger::AccountId;
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use std::rc::Rc;

/// Claims issued by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: String,
    pub exp: usize,
}

/// Verified caller, placed in request extensions by [`JwtAuth`]
#[derive(Debug, Clone)]
pub struct Identity {
    pub account_id: AccountId,
    pub email: Option<String>,
    pub is_admin: bool,
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|err| {
            tracing::warn!("JWT validation failed: {:?}", err);
            ApiError::Unauthorized("Invalid or expired token".to_string())
        })?;

    if data.claims.sub.is_empty() {
        return Err(ApiError::Unauthorized("Token has no subject".to_string()));
    }
    Ok(data.claims)
}

/// Resolves the bearer token, when present, into an [`Identity`].
///
/// Requests without a token pass through anonymously; the route's extractor
/// decides whether that is acceptable. A token that fails verification is
/// rejected outright.
pub struct JwtAuth {
    secret: Rc<String>,
    admin_role: Rc<String>,
}

impl JwtAuth {
    pub fn new(secret: String, admin_role: String) -> Self {
        Self {
            secret: Rc::new(secret),
            admin_role: Rc::new(admin_role),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = JwtAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtAuthMiddleware {
            service: Rc::new(service),
            secret: self.secret.clone(),
            admin_role: self.admin_role.clone(),
        }))
    }
}

pub struct JwtAuthMiddleware<S> {
    service: Rc<S>,
    secret: Rc<String>,
    admin_role: Rc<String>,
}

impl<S, B> Service<ServiceRequest> for JwtAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = match req.headers().get("Authorization") {
            Some(value) => {
                let auth_str = value.to_str().unwrap_or("");
                match auth_str.strip_prefix("Bearer ") {
                    Some(token) => Some(token.trim().to_string()),
                    None => {
                        return Box::pin(async {
                            Err(ApiError::Unauthorized("Invalid auth header format".to_string())
                                .into())
                        });
                    }
                }
            }
            None => None,
        };

        if let Some(token) = token {
            match verify_token(&token, &self.secret) {
                Ok(claims) => {
                    let identity = Identity {
                        account_id: AccountId::new(claims.sub),
                        email: claims.email,
                        is_admin: claims.role == *self.admin_role,
                    };
                    req.extensions_mut().insert(identity);
                }
                Err(err) => return Box::pin(async move { Err(err.into()) }),
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await })
    }
}

/// Extractor for routes that require a signed-in caller
#[derive(Debug, Clone)]
pub struct AuthenticatedAccount(pub Identity);

impl AuthenticatedAccount {
    pub fn account_id(&self) -> &AccountId {
        &self.0.account_id
    }
}

impl FromRequest for AuthenticatedAccount {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Identity>()
                .cloned()
                .map(AuthenticatedAccount)
                .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string())),
        )
    }
}

/// Extractor for administrative routes
#[derive(Debug, Clone)]
pub struct AdminAccount(pub Identity);

impl FromRequest for AdminAccount {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let result = match req.extensions().get::<Identity>() {
            Some(identity) if identity.is_admin => Ok(AdminAccount(identity.clone())),
            Some(_) => Err(ApiError::Forbidden),
            None => Err(ApiError::Unauthorized("Missing Authorization header".to_string())),
        };
        ready(result)
    }
}
