//! A scripted in-memory transport standing in for a set of relays.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use weft_client::{MessageHandler, Transport};

/// Computes the frames a relay sends back in response to one client frame.
pub type Responder = Arc<dyn Fn(&str, &str) -> Vec<String> + Send + Sync>;

#[derive(Default)]
struct Inner {
    connected: HashSet<String>,
    refuse_open: HashSet<String>,
    send_ok: HashMap<String, bool>,
    handlers: HashMap<String, MessageHandler>,
    sent: Vec<(String, String)>,
    responders: Vec<Responder>,
}

/// An in-memory [`Transport`] whose relays answer according to scripted
/// responders. Frames are delivered to the attached handler synchronously,
/// so tests run without real I/O or sleeps.
#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<Inner>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make connection attempts to the given relay fail.
    pub fn refuse_open(&self, uri: &str) {
        self.inner
            .lock()
            .unwrap()
            .refuse_open
            .insert(uri.to_string());
    }

    /// Make sends to the given relay fail.
    pub fn fail_sends(&self, uri: &str) {
        self.inner
            .lock()
            .unwrap()
            .send_ok
            .insert(uri.to_string(), false);
    }

    /// Script the relay side: the responder sees every frame sent to any
    /// connected relay and returns the frames to deliver back on it.
    pub fn respond(&self, responder: impl Fn(&str, &str) -> Vec<String> + Send + Sync + 'static) {
        self.inner
            .lock()
            .unwrap()
            .responders
            .push(Arc::new(responder));
    }

    /// Every frame sent to the given relay so far.
    pub fn sent_to(&self, uri: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(u, _)| u == uri)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Simulate a spontaneous connection drop, invisible to the pool until
    /// it reconciles.
    pub fn drop_connection(&self, uri: &str) {
        self.inner.lock().unwrap().connected.remove(uri);
    }

    /// Deliver a frame to the client as if the relay had pushed it.
    pub fn deliver(&self, uri: &str, frame: &str) {
        let handler = self.inner.lock().unwrap().handlers.get(uri).cloned();
        if let Some(handler) = handler {
            handler(frame.to_string());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) {}

    async fn stop(&self) {
        self.inner.lock().unwrap().connected.clear();
    }

    async fn open(&self, uri: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.refuse_open.contains(uri) {
            inner.connected.insert(uri.to_string());
        }
    }

    async fn close(&self, uri: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected.remove(uri);
        inner.handlers.remove(uri);
    }

    async fn is_connected(&self, uri: &str) -> bool {
        self.inner.lock().unwrap().connected.contains(uri)
    }

    async fn send(&self, message: &str, uri: &str) -> (String, bool) {
        let (ok, replies, handler) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connected.contains(uri) {
                return (uri.to_string(), false);
            }
            inner.sent.push((uri.to_string(), message.to_string()));
            let ok = inner.send_ok.get(uri).copied().unwrap_or(true);
            let replies: Vec<String> = if ok {
                inner
                    .responders
                    .iter()
                    .flat_map(|respond| respond(uri, message))
                    .collect()
            } else {
                Vec::new()
            };
            (ok, replies, inner.handlers.get(uri).cloned())
        };

        if let Some(handler) = handler {
            for reply in replies {
                handler(reply);
            }
        }
        (uri.to_string(), ok)
    }

    async fn receive(&self, uri: &str, handler: MessageHandler) {
        self.inner
            .lock()
            .unwrap()
            .handlers
            .insert(uri.to_string(), handler);
    }
}
