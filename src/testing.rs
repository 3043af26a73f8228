//! In-process relay used by tests: keeps events in memory and answers a
//! minimal subset of NIP-01 (`EVENT`, `REQ`, `CLOSE`).

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{
    api::ApiClient,
    community::{Community, QueryTimeouts},
    event::Event,
    message::{ClientMessage, RelayMessage},
    relay::{PoolOptions, RelayPool},
    server::router,
    tagging::Scope,
};

/// How the stub answers `EVENT` submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behaviour {
    /// Store the event and answer `OK true`.
    #[default]
    Accept,
    /// Answer `OK false` and drop the event.
    Reject,
    /// Store the event but never answer.
    Silent,
}

pub struct StubRelay {
    pub url: String,
    events: Arc<Mutex<Vec<Event>>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_loop: JoinHandle<()>,
}

impl StubRelay {
    pub async fn spawn(behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let store = events.clone();
        let conns = connections.clone();
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = store.clone();
                let handle = tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        serve(ws, store, behaviour).await;
                    }
                });
                conns.lock().unwrap().push(handle);
            }
        });
        Self {
            url: format!("ws://{addr}"),
            events,
            connections,
            accept_loop,
        }
    }

    /// Seed an event without going through the socket.
    pub fn insert(&self, ev: Event) {
        self.events.lock().unwrap().push(ev);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_kind(&self, kind: u32) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind == kind).count()
    }

    /// Abort every open connection while keeping the listener up.
    pub fn drop_connections(&self) {
        for handle in self.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for StubRelay {
    fn drop(&mut self) {
        self.accept_loop.abort();
        self.drop_connections();
    }
}

/// Community API served on an ephemeral port, backed by `relay`.
pub struct TestApi {
    pub client: ApiClient,
    pub base: String,
    handle: JoinHandle<()>,
}

impl TestApi {
    pub async fn spawn(relay: &StubRelay) -> Self {
        let pool = RelayPool::open(
            vec![relay.url.clone()],
            PoolOptions {
                publish_timeout: Duration::from_millis(500),
                tor_socks: None,
            },
        );
        let community = Arc::new(Community::new(
            Arc::new(pool),
            Scope::default(),
            QueryTimeouts::from_list(Duration::from_millis(1500)),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router(community).into_make_service())
                .await
                .unwrap();
        });
        let base = format!("http://{addr}");
        Self {
            client: ApiClient::new(format!("{base}/api/")),
            base,
            handle,
        }
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    store: Arc<Mutex<Vec<Event>>>,
    behaviour: Behaviour,
) {
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(txt) = msg else { continue };
        let replies = match ClientMessage::parse(&txt) {
            Some(ClientMessage::Event(ev)) => handle_event(ev, &store, behaviour),
            Some(ClientMessage::Req { sub_id, filters }) => {
                let events = store.lock().unwrap().clone();
                let mut out = Vec::new();
                for filter in &filters {
                    let mut matching: Vec<Event> =
                        events.iter().filter(|e| filter.matches(e)).cloned().collect();
                    matching.sort_by_key(|e| std::cmp::Reverse(e.created_at));
                    if let Some(limit) = filter.limit {
                        matching.truncate(limit);
                    }
                    out.extend(matching.into_iter().map(|event| RelayMessage::Event {
                        sub_id: sub_id.clone(),
                        event,
                    }));
                }
                out.push(RelayMessage::Eose(sub_id));
                out
            }
            Some(ClientMessage::Close(_)) => vec![],
            None => vec![RelayMessage::Notice("could not parse message".into())],
        };
        for reply in replies {
            if ws.send(Message::Text(reply.to_json())).await.is_err() {
                return;
            }
        }
    }
}

fn handle_event(ev: Event, store: &Mutex<Vec<Event>>, behaviour: Behaviour) -> Vec<RelayMessage> {
    let event_id = ev.id.clone();
    match behaviour {
        Behaviour::Reject => vec![RelayMessage::Ok {
            event_id,
            accepted: false,
            message: "blocked: test relay".into(),
        }],
        Behaviour::Silent => {
            store.lock().unwrap().push(ev);
            vec![]
        }
        Behaviour::Accept => {
            if let Err(e) = ev.verify() {
                return vec![RelayMessage::Ok {
                    event_id,
                    accepted: false,
                    message: format!("invalid: {e}"),
                }];
            }
            let mut events = store.lock().unwrap();
            if !events.iter().any(|e| e.id == ev.id) {
                events.push(ev);
            }
            vec![RelayMessage::Ok {
                event_id,
                accepted: true,
                message: String::new(),
            }]
        }
    }
}
