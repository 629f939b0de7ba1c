use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use applytrack_core::{system_clock, AuthContext, Clock};
use chrono::{DateTime, Utc};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    password::PasswordHasher,
    token::{AccessClaims, TokenError, TokenSigner},
};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);
pub const MIN_PASSWORD_LEN: usize = 6;

const AUTHENTICATED_ROLE: &str = "authenticated";
const TOKEN_TYPE: &str = "bearer";
const REFRESH_TOKEN_BYTES: usize = 32;

/// Identity managed by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub user_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sign_in_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn auth_context(&self) -> AuthContext {
        AuthContext::User(self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

impl Session {
    pub fn auth_context(&self) -> AuthContext {
        self.user.auth_context()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub session: Session,
}

/// Fields accepted by [`MockAuth::update_user`]. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserAttributes {
    pub email: Option<String>,
    pub password: Option<String>,
    /// Merged key by key into `user_metadata`.
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unable to validate email address: {0}")]
    InvalidEmail(String),
    #[error("password should be at least {min} characters")]
    WeakPassword { min: usize },
    #[error("user already registered")]
    UserAlreadyExists,
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("invalid refresh token: refresh token not found")]
    InvalidRefreshToken,
    #[error("session from access token does not exist")]
    SessionNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("user metadata must be a JSON object")]
    InvalidMetadata,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("unexpected auth failure: {0}")]
    Internal(String),
}

impl AuthError {
    /// Machine readable error code, as returned by the hosted auth API.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEmail(_) => "email_address_invalid",
            Self::WeakPassword { .. } => "weak_password",
            Self::UserAlreadyExists => "user_already_exists",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidRefreshToken => "refresh_token_not_found",
            Self::SessionNotFound => "session_not_found",
            Self::UserNotFound => "user_not_found",
            Self::InvalidMetadata => "validation_failed",
            Self::Token(TokenError::Expired) => "session_expired",
            Self::Token(TokenError::Invalid(_)) => "bad_jwt",
            Self::Internal(_) => "unexpected_failure",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidEmail(_)
            | Self::InvalidCredentials
            | Self::InvalidRefreshToken
            | Self::InvalidMetadata => 400,
            Self::Token(_) | Self::SessionNotFound => 403,
            Self::UserNotFound => 404,
            Self::WeakPassword { .. } | Self::UserAlreadyExists => 422,
            Self::Internal(_) => 500,
        }
    }
}

/// In-memory auth service. Cloning shares the same user registry.
#[derive(Clone)]
pub struct MockAuth {
    state: Arc<Mutex<AuthState>>,
    hasher: PasswordHasher,
    signer: TokenSigner,
    session_ttl: Duration,
    clock: Clock,
    latency: Duration,
}

#[derive(Default)]
struct AuthState {
    users: HashMap<String, StoredUser>,
    /// Normalized email to user id.
    emails: HashMap<String, String>,
    sessions: HashMap<String, SessionRecord>,
    last_stamp: Option<DateTime<Utc>>,
}

impl AuthState {
    fn next_timestamp(&mut self, clock: &Clock) -> DateTime<Utc> {
        let now = clock();
        let stamp = match self.last_stamp {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

struct StoredUser {
    user: User,
    password_hash: String,
}

struct SessionRecord {
    user_id: String,
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Refresh tokens stay usable for one extra TTL after the access token expires.
    fn refresh_deadline(&self, ttl: chrono::Duration) -> DateTime<Utc> {
        self.expires_at + ttl
    }
}

impl MockAuth {
    /// Creates a service signing tokens and password digests with `secret`.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        let secret = secret.into();
        Self {
            state: Arc::new(Mutex::new(AuthState::default())),
            signer: TokenSigner::new(&secret),
            hasher: PasswordHasher::new(secret),
            session_ttl: DEFAULT_SESSION_TTL,
            clock: system_clock(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Registers a new identity and opens a session for it.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<AuthResponse, AuthError> {
        self.simulate_latency().await;
        let result = self.register(email, password, metadata);
        record_attempt("sign_up", &result);
        result
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, AuthError> {
        self.simulate_latency().await;
        let result = self.authenticate_password(email, password);
        record_attempt("sign_in", &result);
        result
    }

    /// Revokes the session. Signing out an already revoked session succeeds.
    pub async fn sign_out(&self, session: &Session) -> Result<(), AuthError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, record| record.access_token != session.access_token);
        let revoked = before - state.sessions.len();
        info!(stage = "auth", user_id = %session.user.id, revoked, "session signed out");
        Ok(())
    }

    pub async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        self.simulate_latency().await;
        let state = self.lock();
        let claims = self.authorize(&state, access_token)?;
        state
            .users
            .get(&claims.sub)
            .map(|stored| stored.user.clone())
            .ok_or(AuthError::UserNotFound)
    }

    /// Returns the live session behind `access_token`.
    pub async fn get_session(&self, access_token: &str) -> Result<Session, AuthError> {
        self.simulate_latency().await;
        let state = self.lock();
        let claims = self.authorize(&state, access_token)?;
        let record = state
            .sessions
            .get(&claims.session_id)
            .ok_or(AuthError::SessionNotFound)?;
        let user = state
            .users
            .get(&record.user_id)
            .map(|stored| stored.user.clone())
            .ok_or(AuthError::UserNotFound)?;
        let now = (self.clock)();
        Ok(Session {
            access_token: record.access_token.clone(),
            refresh_token: record.refresh_token.clone(),
            token_type: TOKEN_TYPE.to_string(),
            expires_in: (record.expires_at - now).num_seconds().max(0),
            expires_at: record.expires_at,
            user,
        })
    }

    /// Applies `attributes` to the session's user. Validation happens before
    /// any field changes, so a rejected update leaves the user untouched.
    pub async fn update_user(
        &self,
        session: &Session,
        attributes: UserAttributes,
    ) -> Result<User, AuthError> {
        self.simulate_latency().await;
        let result = self.apply_update(session, attributes);
        record_attempt("update_user", &result);
        result
    }

    /// Exchanges a refresh token for a new session. The old session is revoked.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        let session_id = state
            .sessions
            .iter()
            .find(|(_, record)| record.refresh_token == refresh_token)
            .map(|(id, _)| id.clone())
            .ok_or(AuthError::InvalidRefreshToken)?;
        let Some(record) = state.sessions.remove(&session_id) else {
            return Err(AuthError::InvalidRefreshToken);
        };
        if record.refresh_deadline(self.ttl()?) <= (self.clock)() {
            return Err(AuthError::InvalidRefreshToken);
        }
        let user = state
            .users
            .get(&record.user_id)
            .map(|stored| stored.user.clone())
            .ok_or(AuthError::UserNotFound)?;
        let now = state.next_timestamp(&self.clock);
        let session = self.issue_session(&mut state, &user, now)?;
        debug!(stage = "auth", user_id = %user.id, "session refreshed");
        Ok(session)
    }

    /// Removes an identity together with all of its sessions.
    pub async fn delete_user(&self, user_id: &str) -> Result<User, AuthError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        let stored = state.users.remove(user_id).ok_or(AuthError::UserNotFound)?;
        state.emails.remove(&stored.user.email);
        state.sessions.retain(|_, record| record.user_id != user_id);
        info!(stage = "auth", user_id, "user deleted");
        Ok(stored.user)
    }

    /// Number of sessions currently held, expired or not.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn register(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<AuthResponse, AuthError> {
        let email = normalize_email(email)?;
        check_password(password)?;
        let user_metadata = match metadata {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => return Err(AuthError::InvalidMetadata),
        };
        let password_hash = self
            .hasher
            .hash(password)
            .map_err(|err| AuthError::Internal(err.to_string()))?;

        let mut state = self.lock();
        if state.emails.contains_key(&email) {
            warn!(stage = "auth", "sign up rejected: email already registered");
            return Err(AuthError::UserAlreadyExists);
        }

        let now = state.next_timestamp(&self.clock);
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            role: AUTHENTICATED_ROLE.to_string(),
            user_metadata,
            created_at: now,
            updated_at: now,
            last_sign_in_at: Some(now),
        };
        state.emails.insert(email, user.id.clone());
        state.users.insert(
            user.id.clone(),
            StoredUser {
                user: user.clone(),
                password_hash,
            },
        );
        let session = self.issue_session(&mut state, &user, now)?;
        info!(stage = "auth", user_id = %user.id, "user signed up");
        Ok(AuthResponse { user, session })
    }

    fn authenticate_password(&self, email: &str, password: &str) -> Result<AuthResponse, AuthError> {
        let email = email.trim().to_lowercase();
        let mut state = self.lock();
        let user_id = state
            .emails
            .get(&email)
            .and_then(|id| state.users.get(id))
            .filter(|stored| self.hasher.verify(password, &stored.password_hash))
            .map(|stored| stored.user.id.clone());
        let Some(user_id) = user_id else {
            warn!(stage = "auth", "sign in rejected: invalid credentials");
            return Err(AuthError::InvalidCredentials);
        };

        let now = state.next_timestamp(&self.clock);
        let user = {
            let stored = state
                .users
                .get_mut(&user_id)
                .ok_or(AuthError::UserNotFound)?;
            stored.user.last_sign_in_at = Some(now);
            stored.user.clone()
        };
        let session = self.issue_session(&mut state, &user, now)?;
        info!(stage = "auth", user_id = %user.id, "user signed in");
        Ok(AuthResponse { user, session })
    }

    fn apply_update(&self, session: &Session, attributes: UserAttributes) -> Result<User, AuthError> {
        let email = attributes
            .email
            .as_deref()
            .map(normalize_email)
            .transpose()?;
        let password_hash = match attributes.password.as_deref() {
            Some(password) => {
                check_password(password)?;
                Some(
                    self.hasher
                        .hash(password)
                        .map_err(|err| AuthError::Internal(err.to_string()))?,
                )
            }
            None => None,
        };
        let data = match attributes.data {
            None => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => return Err(AuthError::InvalidMetadata),
        };

        let mut state = self.lock();
        let claims = self.authorize(&state, &session.access_token)?;
        if let Some(email) = &email {
            if state
                .emails
                .get(email)
                .is_some_and(|owner| owner != &claims.sub)
            {
                return Err(AuthError::UserAlreadyExists);
            }
        }

        let now = state.next_timestamp(&self.clock);
        let stored = state
            .users
            .get_mut(&claims.sub)
            .ok_or(AuthError::UserNotFound)?;
        let mut replaced_email = None;
        if let Some(email) = email {
            if email != stored.user.email {
                replaced_email = Some(std::mem::replace(&mut stored.user.email, email));
            }
        }
        if let Some(hash) = password_hash {
            stored.password_hash = hash;
        }
        if let Some(data) = data {
            if !stored.user.user_metadata.is_object() {
                stored.user.user_metadata = Value::Object(Map::new());
            }
            if let Value::Object(metadata) = &mut stored.user.user_metadata {
                metadata.extend(data);
            }
        }
        stored.user.updated_at = now;
        let user = stored.user.clone();

        if let Some(previous) = replaced_email {
            state.emails.remove(&previous);
            state.emails.insert(user.email.clone(), user.id.clone());
        }
        info!(stage = "auth", user_id = %user.id, "user updated");
        Ok(user)
    }

    fn authorize(&self, state: &AuthState, access_token: &str) -> Result<AccessClaims, AuthError> {
        let claims = self.signer.verify(access_token, (self.clock)())?;
        state
            .sessions
            .get(&claims.session_id)
            .filter(|record| record.access_token == access_token)
            .ok_or(AuthError::SessionNotFound)?;
        Ok(claims)
    }

    fn issue_session(
        &self,
        state: &mut AuthState,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let ttl = self.ttl()?;
        let expires_at = now + ttl;
        let session_id = Uuid::new_v4().to_string();
        let claims = AccessClaims {
            sub: user.id.clone(),
            email: user.email.clone(),
            session_id: session_id.clone(),
            role: user.role.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let access_token = self.signer.sign(&claims)?;
        let refresh_token = generate_refresh_token();
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, record| record.refresh_deadline(ttl) > now);
        let pruned = before - state.sessions.len();
        if pruned > 0 {
            debug!(stage = "auth", pruned, "expired sessions pruned");
        }
        state.sessions.insert(
            session_id,
            SessionRecord {
                user_id: user.id.clone(),
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
                expires_at,
            },
        );
        Ok(Session {
            access_token,
            refresh_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: ttl.num_seconds(),
            expires_at,
            user: user.clone(),
        })
    }

    fn ttl(&self) -> Result<chrono::Duration, AuthError> {
        chrono::Duration::from_std(self.session_ttl)
            .map_err(|err| AuthError::Internal(err.to_string()))
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().expect("auth state poisoned")
    }
}

fn record_attempt<T>(operation: &'static str, result: &Result<T, AuthError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.code(),
    };
    counter!("auth_attempts_total", "operation" => operation, "result" => outcome).increment(1);
}

fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
                && domain.contains('.')
                && domain.split('.').all(|label| !label.is_empty())
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(AuthError::InvalidEmail(raw.to_string()))
    }
}

fn check_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
