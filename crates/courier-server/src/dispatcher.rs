//! Frame validation and request handling.
//!
//! [`Dispatcher::handle`] is the error boundary for one inbound frame:
//! whatever goes wrong inside a handler is turned into a response frame
//! (or silently dropped, for typing) and never escapes into the
//! connection's read loop.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use courier_shared::protocol::{RequestKind, ServerFrame};
use courier_shared::types::UserId;
use courier_store::StoreError;

use crate::connection::{AuthState, Connection};
use crate::credentials::CredentialVerifier;
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::router::MessageRouter;
use crate::store::Store;

const LOGIN_FAILED: &str = "Invalid username or password";

pub struct Dispatcher {
    store: Store,
    registry: SessionRegistry,
    router: MessageRouter,
    credentials: Arc<dyn CredentialVerifier>,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        registry: SessionRegistry,
        credentials: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let router = MessageRouter::new(store.clone(), registry.clone());
        Self {
            store,
            registry,
            router,
            credentials,
        }
    }

    /// Handle one complete frame from `conn`.
    pub async fn handle(&self, raw: &[u8], conn: &mut Connection) {
        let request: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!(conn = %conn.id, error = %e, "invalid JSON frame");
                conn.send(ServerFrame::error("Invalid JSON format"));
                return;
            }
        };

        let kind = match request.get("type") {
            None => {
                conn.send(ServerFrame::error("Missing message type"));
                return;
            }
            Some(Value::String(t)) => match t.parse::<RequestKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    debug!(conn = %conn.id, kind = %t, "unknown message type");
                    conn.send(ServerFrame::error(ServerError::from(e).client_message()));
                    return;
                }
            },
            Some(other) => {
                debug!(conn = %conn.id, kind = %other, "non-string message type");
                conn.send(ServerFrame::error(format!("Unknown message type: {other}")));
                return;
            }
        };

        let result = match kind {
            RequestKind::Register => self.register(&request, conn).await,
            RequestKind::Login => self.login(&request, conn).await,
            RequestKind::Message => self.message(&request, conn).await,
            RequestKind::Typing => self.typing(&request, conn).await,
        };

        if let Err(e) = result {
            error!(conn = %conn.id, kind = %kind, error = %e, "request failed");
            let message = match kind {
                RequestKind::Register => "Registration error",
                RequestKind::Login => "Login error",
                RequestKind::Message => "Message delivery error",
                RequestKind::Typing => return,
            };
            if let Some(frame) = ServerFrame::response(kind, false, message) {
                conn.send(frame);
            }
        }
    }

    async fn register(&self, request: &Value, conn: &mut Connection) -> Result<(), ServerError> {
        let [username, email, password] =
            match required_fields(request, ["username", "email", "password"], false) {
                Ok(fields) => fields,
                Err(msg) => {
                    conn.send(ServerFrame::error(msg));
                    return Ok(());
                }
            };

        let password_hash = self.credentials.hash(password);
        let (success, message) = match self.store.create_user(username, email, password_hash).await {
            Ok(user) => {
                info!(user_id = %user.id, username = %user.username, "user registered");
                (true, "Registration successful")
            }
            Err(ServerError::Store(StoreError::AlreadyExists)) => {
                debug!(username = %username, "registration rejected, user exists");
                (false, "Registration failed - user may already exist")
            }
            Err(e) => return Err(e),
        };

        if let Some(frame) = ServerFrame::response(RequestKind::Register, success, message) {
            conn.send(frame);
        }
        Ok(())
    }

    async fn login(&self, request: &Value, conn: &mut Connection) -> Result<(), ServerError> {
        let [username, password] = match required_fields(request, ["username", "password"], true) {
            Ok(fields) => fields,
            Err(msg) => {
                conn.send(ServerFrame::error(msg));
                return Ok(());
            }
        };

        let user = match self.store.find_user_by_name(username).await? {
            Some(user) if self.credentials.verify(password, &user.password_hash) => user,
            Some(_) => {
                debug!(conn = %conn.id, username = %username, "login failed: wrong password");
                return self.login_failed(conn);
            }
            None => {
                debug!(conn = %conn.id, username = %username, "login failed: unknown user");
                return self.login_failed(conn);
            }
        };

        // Switching accounts on one connection gives up the old session.
        if let Some(previous) = conn.user_id() {
            if previous != user.id {
                self.registry.release(previous, conn.id).await;
            }
        }

        conn.authenticate(user.id, user.username.clone());

        // No message for this user may be relayed live until everything
        // stored for them has been queued behind the login response.
        let _inbox = self.router.lock_inbox(user.id).await;
        self.registry
            .add(user.id, &user.username, conn.outbox.clone())
            .await;

        info!(conn = %conn.id, user_id = %user.id, username = %user.username, "login successful");
        if let Some(frame) = ServerFrame::response(RequestKind::Login, true, "Login successful") {
            conn.send(frame);
        }

        self.router.flush_pending(user.id, &conn.outbox).await;
        Ok(())
    }

    fn login_failed(&self, conn: &Connection) -> Result<(), ServerError> {
        if let Some(frame) = ServerFrame::response(RequestKind::Login, false, LOGIN_FAILED) {
            conn.send(frame);
        }
        Ok(())
    }

    async fn message(&self, request: &Value, conn: &mut Connection) -> Result<(), ServerError> {
        let Some((user_id, username)) = self.authenticated(conn).await else {
            if let Some(frame) =
                ServerFrame::response(RequestKind::Message, false, "Not authenticated")
            {
                conn.send(frame);
            }
            return Ok(());
        };

        let [to, content] = match required_fields(request, ["to", "content"], true) {
            Ok(fields) => fields,
            Err(msg) => {
                conn.send(ServerFrame::error(msg));
                return Ok(());
            }
        };

        // Accepted means handed to the router, not read by the peer; an
        // unknown recipient still gets success here.
        self.router.deliver(user_id, &username, to, content).await?;

        if let Some(frame) = ServerFrame::response(RequestKind::Message, true, "Message sent") {
            conn.send(frame);
        }
        Ok(())
    }

    async fn typing(&self, request: &Value, conn: &mut Connection) -> Result<(), ServerError> {
        let Some((_, username)) = self.authenticated(conn).await else {
            debug!(conn = %conn.id, "ignoring typing from unauthenticated connection");
            return Ok(());
        };

        let to = request.get("to").and_then(Value::as_str);
        let is_typing = request.get("is_typing").and_then(Value::as_bool);
        let (Some(to), Some(is_typing)) = (to, is_typing) else {
            debug!(conn = %conn.id, "ignoring malformed typing frame");
            return Ok(());
        };

        self.router.relay_typing(&username, to, is_typing).await;
        Ok(())
    }

    /// The connection's identity, if it is logged in and still holds the
    /// registry entry for that user.
    async fn authenticated(&self, conn: &Connection) -> Option<(UserId, String)> {
        match &conn.auth {
            AuthState::Authenticated { user_id, username }
                if self.registry.is_current(*user_id, conn.id).await =>
            {
                Some((*user_id, username.clone()))
            }
            _ => None,
        }
    }
}

/// Pull string fields out of a request object.
///
/// On failure returns the error text naming every missing field.
fn required_fields<'a, const N: usize>(
    request: &'a Value,
    names: [&'static str; N],
    allow_empty: bool,
) -> Result<[&'a str; N], String> {
    let mut values = [""; N];
    let mut missing = Vec::new();

    for (slot, name) in values.iter_mut().zip(names) {
        match request.get(name).and_then(Value::as_str) {
            Some(v) if allow_empty || !v.is_empty() => *slot = v,
            _ => missing.push(name),
        }
    }

    if missing.is_empty() {
        Ok(values)
    } else {
        Err(format!("Missing required fields: {}", missing.join(", ")))
    }
}
