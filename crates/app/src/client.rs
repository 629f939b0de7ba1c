use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use applytrack_auth::{AuthError, AuthResponse, MockAuth, Session, User, UserAttributes};
use applytrack_core::{system_clock, AuthContext, Clock, Table};
use applytrack_storage::{Bucket, DbError, MockDatabase, ObjectStorage, Query, RlsViolation};
use applytrack_util::{AppConfig, RlsViolationMode};

use crate::realtime::{RealtimeHub, ReconnectPolicy};

/// Settings used to assemble a [`MockClient`].
#[derive(Clone)]
pub struct ClientOptions {
    pub jwt_secret: String,
    pub session_ttl: Duration,
    pub latency: Duration,
    pub storage_public_url: Url,
    pub reconnect: ReconnectPolicy,
    pub rls_violation: RlsViolation,
    pub clock: Clock,
}

impl ClientOptions {
    pub fn new(jwt_secret: impl Into<String>, storage_public_url: Url) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            session_ttl: applytrack_auth::service::DEFAULT_SESSION_TTL,
            latency: Duration::ZERO,
            storage_public_url,
            reconnect: ReconnectPolicy::default(),
            rls_violation: RlsViolation::default(),
            clock: system_clock(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            jwt_secret: config.jwt_secret.clone(),
            session_ttl: config.session_ttl,
            latency: config.simulated_latency,
            storage_public_url: config.storage_public_url.clone(),
            reconnect: ReconnectPolicy {
                max_attempts: config.realtime_reconnect_attempts,
                delay: config.realtime_reconnect_delay,
            },
            rls_violation: match config.rls_violation {
                RlsViolationMode::Skip => RlsViolation::Skip,
                RlsViolationMode::Reject => RlsViolation::Reject,
            },
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Single entry point bundling database, auth, storage and realtime.
///
/// The client remembers the session of its last successful sign-up or
/// sign-in; queries built through [`MockClient::from`] run as that user.
#[derive(Clone)]
pub struct MockClient {
    db: MockDatabase,
    auth: MockAuth,
    storage: ObjectStorage,
    realtime: RealtimeHub,
    session: Arc<Mutex<Option<Session>>>,
    clock: Clock,
}

impl MockClient {
    pub fn new(options: ClientOptions) -> Self {
        let realtime = RealtimeHub::new(options.reconnect);
        let db = MockDatabase::new()
            .with_clock(options.clock.clone())
            .with_latency(options.latency)
            .with_rls_violation(options.rls_violation)
            .with_sink(Arc::new(realtime.clone()));
        let auth = MockAuth::new(options.jwt_secret.into_bytes())
            .with_clock(options.clock.clone())
            .with_session_ttl(options.session_ttl)
            .with_latency(options.latency);
        let storage = ObjectStorage::new(options.storage_public_url, options.clock.clone());
        Self {
            db,
            auth,
            storage,
            realtime,
            session: Arc::new(Mutex::new(None)),
            clock: options.clock,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(ClientOptions::from_config(config))
    }

    /// Another client on the same backend with its own, empty session slot.
    pub fn with_fresh_session(&self) -> Self {
        Self {
            session: Arc::new(Mutex::new(None)),
            ..self.clone()
        }
    }

    pub fn auth(&self) -> ClientAuth<'_> {
        ClientAuth { client: self }
    }

    /// Starts a query as the current session's user, or anonymously.
    pub fn from(&self, table: Table) -> Query {
        self.db.from(table, &self.auth_context())
    }

    /// Starts a query that bypasses row-level security.
    pub fn service(&self, table: Table) -> Query {
        self.db.from(table, &AuthContext::Service)
    }

    pub fn storage(&self, bucket: &str) -> Bucket {
        self.storage.from(bucket)
    }

    pub fn realtime(&self) -> &RealtimeHub {
        &self.realtime
    }

    pub fn database(&self) -> &MockDatabase {
        &self.db
    }

    /// Current time according to the client's clock.
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn auth_context(&self) -> AuthContext {
        self.session_guard()
            .as_ref()
            .map(Session::auth_context)
            .unwrap_or_default()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.session_guard().clone()
    }

    pub(crate) fn set_session(&self, session: Option<Session>) {
        *self.session_guard() = session;
    }

    fn session_guard(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().expect("client session poisoned")
    }

    /// Mirrors a new identity into the `users` and `profiles` tables.
    async fn provision(&self, user: &User) -> Result<(), DbError> {
        self.service(Table::Users)
            .insert(json!({ "id": user.id, "email": user.email }))
            .execute()
            .await?;
        let full_name = user
            .user_metadata
            .get("full_name")
            .cloned()
            .unwrap_or(Value::Null);
        self.service(Table::Profiles)
            .insert(json!({ "user_id": user.id, "full_name": full_name }))
            .execute()
            .await?;
        debug!(stage = "auth", user_id = %user.id, "user rows provisioned");
        Ok(())
    }

    /// Rolls back a partially provisioned sign-up so the email can be reused.
    async fn unprovision(&self, user: &User) {
        for table in [Table::Profiles, Table::Users] {
            let column = if table == Table::Users { "id" } else { "user_id" };
            if let Err(err) = self
                .service(table)
                .delete()
                .eq(column, user.id.as_str())
                .execute()
                .await
            {
                warn!(stage = "auth", user_id = %user.id, %table, error = %err, "failed to remove provisioned row");
            }
        }
        if let Err(err) = self.auth.delete_user(&user.id).await {
            warn!(stage = "auth", user_id = %user.id, error = %err, "failed to remove identity");
        }
        warn!(stage = "auth", user_id = %user.id, "sign up rolled back");
    }
}

/// Auth operations bound to a client's session slot.
pub struct ClientAuth<'a> {
    client: &'a MockClient,
}

impl ClientAuth<'_> {
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<AuthResponse, ClientError> {
        let response = self.client.auth.sign_up(email, password, metadata).await?;
        if let Err(err) = self.client.provision(&response.user).await {
            self.client.unprovision(&response.user).await;
            return Err(err.into());
        }
        self.client.set_session(Some(response.session.clone()));
        Ok(response)
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ClientError> {
        let response = self
            .client
            .auth
            .sign_in_with_password(email, password)
            .await?;
        self.client.set_session(Some(response.session.clone()));
        Ok(response)
    }

    /// Ends the current session. Without a session this is a no-op.
    pub async fn sign_out(&self) -> Result<(), ClientError> {
        let Some(session) = self.client.current_session() else {
            return Ok(());
        };
        self.client.auth.sign_out(&session).await?;
        self.client.set_session(None);
        info!(stage = "auth", "client signed out");
        Ok(())
    }

    pub async fn update_user(&self, attributes: UserAttributes) -> Result<User, ClientError> {
        let session = self.require_session()?;
        let email_changed = attributes.email.is_some();
        let user = self.client.auth.update_user(&session, attributes).await?;
        if email_changed {
            self.client
                .service(Table::Users)
                .update(json!({ "email": user.email }))
                .eq("id", user.id.as_str())
                .execute()
                .await?;
        }
        self.client.set_session(Some(Session {
            user: user.clone(),
            ..session
        }));
        Ok(user)
    }

    pub async fn get_user(&self) -> Result<User, ClientError> {
        let session = self.require_session()?;
        Ok(self.client.auth.get_user(&session.access_token).await?)
    }

    /// Returns the live session, or `None` when signed out.
    pub async fn get_session(&self) -> Result<Option<Session>, ClientError> {
        let Some(session) = self.client.current_session() else {
            return Ok(None);
        };
        Ok(Some(self.client.auth.get_session(&session.access_token).await?))
    }

    pub async fn refresh_session(&self) -> Result<Session, ClientError> {
        let session = self.require_session()?;
        let refreshed = self
            .client
            .auth
            .refresh_session(&session.refresh_token)
            .await?;
        self.client.set_session(Some(refreshed.clone()));
        Ok(refreshed)
    }

    fn require_session(&self) -> Result<Session, ClientError> {
        self.client
            .current_session()
            .ok_or(ClientError::Auth(AuthError::SessionNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{EventFilter, SubscriptionSpec};
    use applytrack_core::{Application, ApplicationStatus, ChangeKind, NewApplication, UserProfile};
    use applytrack_storage::UploadOptions;

    fn client() -> MockClient {
        let base = Url::parse("http://localhost:54321").expect("url");
        let mut options = ClientOptions::new("test-secret", base);
        options.reconnect = ReconnectPolicy {
            max_attempts: 3,
            delay: Duration::ZERO,
        };
        MockClient::new(options)
    }

    #[tokio::test]
    async fn sign_up_provisions_user_and_profile_rows() {
        let client = client();
        let response = client
            .auth()
            .sign_up(
                "ada@example.com",
                "hunter22",
                Some(json!({ "full_name": "Ada Lovelace" })),
            )
            .await
            .expect("sign up");

        assert_eq!(client.auth_context(), AuthContext::User(response.user.id.clone()));
        let profile: UserProfile = client
            .from(Table::Profiles)
            .select("*")
            .single()
            .execute()
            .await
            .expect("profile")
            .decode_one()
            .expect("decode")
            .expect("row");
        assert_eq!(profile.user_id, response.user.id);
        assert_eq!(profile.full_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(client.database().count(Table::Users), 1);
    }

    #[tokio::test]
    async fn failed_provisioning_rolls_back_sign_up() {
        let client = client();
        let err = client
            .auth()
            .sign_up("ada@example.com", "hunter22", Some(json!({ "full_name": 42 })))
            .await
            .expect_err("profile rejects numeric name");
        assert!(matches!(err, ClientError::Db(_)));
        assert_eq!(client.database().count(Table::Users), 0);
        assert_eq!(client.database().count(Table::Profiles), 0);
        assert!(client.current_session().is_none());

        let response = client
            .auth()
            .sign_up("ada@example.com", "hunter22", Some(json!({ "full_name": "Ada" })))
            .await
            .expect("retry succeeds");
        assert_eq!(client.auth_context(), AuthContext::User(response.user.id));
        assert_eq!(client.database().count(Table::Users), 1);
        assert_eq!(client.database().count(Table::Profiles), 1);
    }

    #[tokio::test]
    async fn signed_out_client_is_anonymous() {
        let client = client();
        client
            .auth()
            .sign_up("ada@example.com", "hunter22", None)
            .await
            .expect("sign up");
        client
            .from(Table::Applications)
            .insert_record(&NewApplication::new("Acme", "Engineer"))
            .execute()
            .await
            .expect("insert");

        client.auth().sign_out().await.expect("sign out");
        assert_eq!(client.auth_context(), AuthContext::Anonymous);
        assert!(client.auth().get_session().await.expect("session").is_none());

        let rows = client
            .from(Table::Applications)
            .select("*")
            .execute()
            .await
            .expect("select");
        assert!(rows.is_empty());

        let err = client
            .from(Table::Applications)
            .insert_record(&NewApplication::new("Globex", "Engineer"))
            .execute()
            .await
            .expect_err("anonymous insert");
        assert_eq!(err.code(), "42501");
    }

    #[tokio::test]
    async fn update_user_keeps_users_row_in_sync() {
        let client = client();
        client
            .auth()
            .sign_up("ada@example.com", "hunter22", None)
            .await
            .expect("sign up");
        let user = client
            .auth()
            .update_user(UserAttributes {
                email: Some("ada.l@example.com".into()),
                ..UserAttributes::default()
            })
            .await
            .expect("update");

        let row = client
            .from(Table::Users)
            .select("email")
            .single()
            .execute()
            .await
            .expect("users row")
            .into_value();
        assert_eq!(row["email"], "ada.l@example.com");
        assert_eq!(
            client.current_session().expect("session").user.email,
            user.email
        );
        assert_eq!(client.auth().get_user().await.expect("user").email, user.email);
    }

    #[tokio::test]
    async fn refresh_replaces_current_session() {
        let client = client();
        let response = client
            .auth()
            .sign_up("ada@example.com", "hunter22", None)
            .await
            .expect("sign up");
        let refreshed = client.auth().refresh_session().await.expect("refresh");
        assert_ne!(refreshed.access_token, response.session.access_token);
        assert_eq!(
            client.current_session().expect("session").access_token,
            refreshed.access_token
        );
        client.auth().get_user().await.expect("still signed in");
    }

    #[tokio::test]
    async fn update_and_subscriber_scenario() {
        let client = client();
        client
            .auth()
            .sign_up("ada@example.com", "hunter22", None)
            .await
            .expect("sign up");
        let inserted: Application = client
            .from(Table::Applications)
            .insert_record(&NewApplication::new("Acme", "Engineer"))
            .single()
            .execute()
            .await
            .expect("insert")
            .decode_one()
            .expect("decode")
            .expect("row");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        client.realtime().subscribe(
            SubscriptionSpec::new(EventFilter::Only(ChangeKind::Update), Table::Applications),
            move |event| sink.lock().expect("received").push(event.clone()),
        );

        let updated: Application = client
            .from(Table::Applications)
            .update(json!({ "status": "interviewing" }))
            .eq("id", inserted.id.as_str())
            .single()
            .execute()
            .await
            .expect("update")
            .decode_one()
            .expect("decode")
            .expect("row");

        assert_eq!(updated.status, ApplicationStatus::Interviewing);
        assert!(updated.updated_at > inserted.updated_at);
        let events = received.lock().expect("received");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["status"], "interviewing");
        assert_eq!(
            events[0].old_record.as_ref().expect("old record")["status"],
            "wishlist"
        );
    }

    #[tokio::test]
    async fn storage_uses_configured_public_url() {
        let client = client();
        let avatars = client.storage("avatars");
        avatars
            .upload("u1/avatar.png", b"png".to_vec(), UploadOptions::default())
            .expect("upload");
        let url = avatars.get_public_url("u1/avatar.png").expect("url");
        assert_eq!(
            url.public_url,
            "http://localhost:54321/storage/v1/object/public/avatars/u1/avatar.png"
        );
    }

    #[tokio::test]
    async fn auth_calls_without_session_fail() {
        let client = client();
        let err = client.auth().get_user().await.expect_err("no session");
        assert_eq!(err, ClientError::Auth(AuthError::SessionNotFound));
        client.auth().sign_out().await.expect("no-op sign out");
    }
}
