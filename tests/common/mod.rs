//! Shared fixtures for the session integration suites.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use voice_order_session::core::transport::{ChannelMicrophone, MicrophoneSource};
use voice_order_session::{
    LoopbackFactory, LoopbackRemote, SessionEvent, SessionHandle, SessionOptions,
    SessionServices, SessionState, StaticMenu, StaticTokenBroker,
};

pub const MENU: &str = r#"
items:
  - id: greek-bowl
    name: Greek Bowl
    price_cents: 1295
    aliases: [greek salad bowl]
    modifiers:
      - name: no feta
      - name: extra feta
        price_cents: 150
  - id: falafel-wrap
    name: Falafel Wrap
    price_cents: 1095
    modifiers:
      - name: extra tahini
        price_cents: 75
  - id: chicken-fajitas
    name: Chicken Fajitas
    price_cents: 1595
  - id: espresso
    name: Espresso
    price_cents: 350
"#;

/// Virtual time allowed for any single wait; the clock is paused in these suites.
const WAIT: Duration = Duration::from_secs(3600);

pub fn menu() -> StaticMenu {
    StaticMenu::from_yaml_str(MENU).unwrap()
}

/// Session options with microphone capture off.
pub fn options() -> SessionOptions {
    SessionOptions {
        capture_audio: false,
        ..Default::default()
    }
}

pub struct Fixture {
    pub session: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub remote: LoopbackRemote,
    pub seen: Vec<SessionEvent>,
}

pub fn start(options: SessionOptions) -> Fixture {
    let (microphone, _) = ChannelMicrophone::pair();
    start_with_microphone(options, Arc::new(microphone))
}

pub fn start_with_microphone(
    options: SessionOptions,
    microphone: Arc<dyn MicrophoneSource>,
) -> Fixture {
    let (factory, remote) = LoopbackFactory::pair();
    let services = SessionServices {
        broker: Arc::new(StaticTokenBroker::new("ek_test")),
        peers: Arc::new(factory),
        microphone,
        catalog: Arc::new(menu()),
    };
    let (session, events) = SessionHandle::start(options, services);
    Fixture {
        session,
        events,
        remote,
        seen: Vec::new(),
    }
}

impl Fixture {
    /// Next session event; panics if the session goes quiet.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a session event");
        if let Some(event) = &event {
            self.seen.push(event.clone());
        }
        event
    }

    /// Wait for the first event matching `predicate`.
    pub async fn wait_for(&mut self, predicate: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            match self.next_event().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => {}
                None => panic!("session ended before the expected event; saw {:?}", self.seen),
            }
        }
    }

    /// Wait until the session enters `state`.
    pub async fn wait_for_state(&mut self, state: SessionState) {
        self.wait_for(|event| matches!(event, SessionEvent::StateChanged(change) if change.to == state))
            .await;
    }

    /// Start and wait for the first `IDLE`.
    pub async fn ready(&mut self) {
        self.wait_for_state(SessionState::Idle).await;
    }

    pub fn inject(&self, frame: serde_json::Value) {
        assert!(self.remote.inject_json(frame), "no live connection");
    }

    /// Next frame the session sent with `event_type`.
    pub async fn sent(&self, event_type: &str) -> serde_json::Value {
        tokio::time::timeout(WAIT, self.remote.next_sent(event_type))
            .await
            .expect("timed out waiting for a sent frame")
            .expect("frame channel closed")
    }

    /// States entered so far, in order.
    pub fn states(&self) -> Vec<SessionState> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged(change) => Some(change.to),
                _ => None,
            })
            .collect()
    }

    /// Drain everything until the session's event stream closes.
    pub async fn drain(&mut self) {
        while self.next_event().await.is_some() {}
    }
}

pub fn response_created(id: &str) -> serde_json::Value {
    json!({"type": "response.created", "response": {"id": id, "status": "in_progress"}})
}

pub fn response_done(id: &str, call_ids: &[&str]) -> serde_json::Value {
    let output: Vec<_> = call_ids
        .iter()
        .map(|call_id| json!({"type": "function_call", "call_id": call_id}))
        .collect();
    json!({"type": "response.done", "response": {"id": id, "status": "completed", "output": output}})
}

pub fn function_call(call_id: &str, name: &str, arguments: serde_json::Value) -> serde_json::Value {
    json!({
        "type": "response.function_call_arguments.done",
        "call_id": call_id,
        "name": name,
        "arguments": arguments.to_string(),
    })
}
