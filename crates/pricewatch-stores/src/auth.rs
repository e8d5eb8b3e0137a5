//! Authentication state driven by the provider's session-change stream.

use std::sync::Arc;
use std::time::Duration;

use pricewatch_backend::{AuthEvents, AuthProvider};
use pricewatch_core::{AuthEvent, AuthEventKind, Identity, Session};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const INIT_FAILED: &str = "Authentication service failed to initialize.";

/// How long login/logout/refresh wait for the provider's notification.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct AuthState {
    session: Option<Session>,
    initialized: bool,
    initializing: bool,
    error: Option<String>,
}

struct Shared {
    state: RwLock<AuthState>,
    sessions: watch::Sender<Option<Session>>,
    identity: watch::Sender<Option<Identity>>,
}

impl Shared {
    async fn apply(&self, event: AuthEvent) {
        let mut state = self.state.write().await;
        let user = event.session.as_ref().map(|session| session.user.clone());
        match (&event.kind, &user) {
            (AuthEventKind::SignedOut, _) | (_, None) => {
                info!(event = ?event.kind, "session cleared")
            }
            (_, Some(user)) => {
                info!(event = ?event.kind, user_id = %user.id, "session updated")
            }
        }
        state.session = event.session.clone();
        state.error = None;
        self.sessions.send_replace(event.session);
        self.identity.send_if_modified(|current| {
            if *current != user {
                *current = user;
                true
            } else {
                false
            }
        });
    }

    async fn clear(&self) {
        self.state.write().await.session = None;
        self.sessions.send_replace(None);
        self.identity.send_if_modified(|current| current.take().is_some());
    }

    async fn fail(&self, message: String) {
        self.state.write().await.error = Some(message);
    }
}

#[derive(Clone)]
pub struct AuthSession {
    provider: Arc<dyn AuthProvider>,
    shared: Arc<Shared>,
    listener: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AuthSession {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        let (sessions, _) = watch::channel(None);
        let (identity, _) = watch::channel(None);
        Self {
            provider,
            shared: Arc::new(Shared {
                state: RwLock::new(AuthState::default()),
                sessions,
                identity,
            }),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// Probes the provider and starts following its session changes.
    /// A no-op once initialized. Returns whether the session is initialized.
    pub async fn init(&self) -> bool {
        {
            let mut state = self.shared.state.write().await;
            if state.initialized || state.initializing {
                debug!("auth already initialized");
                return state.initialized;
            }
            state.initializing = true;
        }
        info!("initializing auth session");

        match self.provider.get_session().await {
            Ok(session) => {
                debug!(present = session.is_some(), "stored session probed");
                self.shared.state.write().await.session = session;
            }
            Err(err) => {
                error!(error = %err, "failed to read stored session");
                self.shared.clear().await;
            }
        }

        let events = match self.provider.on_auth_state_change().await {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "auth initialization failed");
                self.shared.clear().await;
                let mut state = self.shared.state.write().await;
                state.initializing = false;
                state.initialized = false;
                state.error = Some(INIT_FAILED.to_string());
                return false;
            }
        };
        self.listen(events).await;

        let mut state = self.shared.state.write().await;
        state.initializing = false;
        state.initialized = true;
        info!("auth session initialized");
        true
    }

    async fn listen(&self, mut events: AuthEvents) {
        if let Some(first) = events.recv().await {
            self.shared.apply(first).await;
        }
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                shared.apply(event).await;
            }
            debug!("auth event stream closed");
        });
        if let Some(previous) = self.listener.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Signs in. Identity is assigned by the resulting notification, not here.
    pub async fn login(&self, email: &str, password: &str) -> bool {
        self.shared.state.write().await.error = None;
        match self.provider.sign_in_with_password(email, password).await {
            Ok(session) => {
                info!(user_id = %session.user.id, "login succeeded");
                self.await_session(|current| {
                    current.is_some_and(|s| s.access_token == session.access_token)
                })
                .await;
                true
            }
            Err(err) => {
                warn!(error = %err, "login failed");
                self.shared.fail(err.to_string()).await;
                false
            }
        }
    }

    /// Signs out. Local identity is cleared even when the provider fails.
    pub async fn logout(&self) -> bool {
        self.shared.state.write().await.error = None;
        match self.provider.sign_out().await {
            Ok(()) => {
                self.await_session(|current| current.is_none()).await;
                info!("logged out");
                true
            }
            Err(err) => {
                error!(error = %err, "logout failed; clearing local session");
                self.shared.fail(err.to_string()).await;
                self.shared.clear().await;
                false
            }
        }
    }

    pub async fn refresh(&self) -> bool {
        match self.provider.refresh_session().await {
            Ok(session) => {
                self.await_session(|current| {
                    current.is_some_and(|s| s.access_token == session.access_token)
                })
                .await;
                true
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                self.shared.fail(err.to_string()).await;
                false
            }
        }
    }

    /// Waits for the listener to publish a matching session. Without a running
    /// listener there is nothing to wait for.
    async fn await_session(&self, accept: impl Fn(Option<&Session>) -> bool) {
        if !self.is_initialized().await {
            debug!("auth not initialized; not waiting for notification");
            return;
        }
        let mut rx = self.shared.sessions.subscribe();
        let waited = rx.wait_for(|current| accept(current.as_ref()));
        let arrived = matches!(tokio::time::timeout(NOTIFY_TIMEOUT, waited).await, Ok(Ok(_)));
        if !arrived {
            warn!("auth notification did not arrive in time");
        }
    }

    pub async fn session(&self) -> Option<Session> {
        self.shared.state.read().await.session.clone()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.shared
            .state
            .read()
            .await
            .session
            .as_ref()
            .map(|session| session.user.id.clone())
    }

    pub async fn error(&self) -> Option<String> {
        self.shared.state.read().await.error.clone()
    }

    pub async fn is_initialized(&self) -> bool {
        self.shared.state.read().await.initialized
    }

    /// Current identity plus every later change.
    pub fn identity(&self) -> watch::Receiver<Option<Identity>> {
        self.shared.identity.subscribe()
    }
}
