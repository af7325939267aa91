use crate::state::AppState;
use crate::websocket::message_types::ServerFrame;
use crate::websocket::session::{Session, SessionTable, SharedSession};
use crate::websocket::{Connection, Outbound};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler, WrapFuture};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;

// WebSocket Actor
//
// Owns the socket for one connection. Inbound frames are handed to the
// session one at a time; outbound frames arrive through the connection's
// send queue, which is added to the context as a stream.
struct WsConnection {
    session: SharedSession,
    sessions: SessionTable,
    connection: Arc<Connection>,
    outbound: Option<UnboundedReceiver<Outbound>>,
    heartbeat_interval: Duration,
    auth_timeout: Duration,
}

impl WsConnection {
    fn new(state: &AppState) -> Self {
        let (connection, outbound) = Connection::new();
        let session = Session::new(state.clone(), connection.clone());
        Self {
            session: Arc::new(Mutex::new(session)),
            sessions: state.sessions.clone(),
            connection,
            outbound: Some(outbound),
            heartbeat_interval: state.config.websocket.heartbeat_interval,
            auth_timeout: state.config.websocket.auth_timeout,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if !act.connection.take_alive() {
                tracing::warn!(connection = ?act.connection.id(), "WebSocket heartbeat missed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");

            let session = act.session.clone();
            actix::spawn(async move {
                session.lock().await.refresh_presence().await;
            });
        });
    }

    fn auth_deadline(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_later(self.auth_timeout, |act, ctx| {
            let session = act.session.clone();
            ctx.wait(
                async move {
                    session.lock().await.expire_authentication();
                }
                .into_actor(act),
            );
        });
    }
}

impl Actor for WsConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }

        self.sessions.insert(self.connection.id(), self.session.clone());
        let session = self.session.clone();
        ctx.wait(
            async move {
                session.lock().await.open();
            }
            .into_actor(self),
        );

        self.hb(ctx);
        self.auth_deadline(ctx);
    }

    // Teardown runs detached; anything still in the table when the server
    // stops is closed by `SessionTable::close_all`.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let session = self.session.clone();
        let sessions = self.sessions.clone();
        let id = self.connection.id();
        actix::spawn(async move {
            session.lock().await.close().await;
            sessions.remove(id);
        });
    }
}

// Frames queued for this socket
impl StreamHandler<Outbound> for WsConnection {
    fn handle(&mut self, item: Outbound, ctx: &mut Self::Context) {
        match item {
            Outbound::Frame(frame) => match frame.to_json() {
                Ok(text) => ctx.text(text),
                Err(e) => tracing::error!(kind = frame.kind(), error = %e, "failed to encode frame"),
            },
            Outbound::Close => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: None,
                }));
                ctx.stop();
            }
        }
    }

    // The queue outlives the socket; its end is not a reason to stop.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.connection.mark_alive();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.connection.mark_alive();
            }
            Ok(ws::Message::Text(text)) => {
                self.connection.mark_alive();
                let session = self.session.clone();
                let text = text.to_string();
                ctx.wait(
                    async move {
                        session.lock().await.handle_text(&text).await;
                    }
                    .into_actor(self),
                );
            }
            Ok(ws::Message::Binary(_)) => {
                self.connection
                    .send(ServerFrame::error("binary frames are not supported"));
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(connection = ?self.connection.id(), ?reason, "WebSocket close received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(connection = ?self.connection.id(), error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    ws::start(WsConnection::new(state.get_ref()), &req, stream)
}
