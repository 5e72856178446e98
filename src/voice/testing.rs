//! Recording fakes for the coordinator's upstream and downstream seams.

use super::coordinator::Downstream;
use super::protocol::{ClientEvent, UpstreamFrame};
use super::upstream::{ConnectRequest, ConnectionId, LinkState, UpstreamLink};
use crate::store::Turn;
use serde_json::Value;

#[derive(Default)]
pub(crate) struct FakeLink {
    pub(crate) state: Option<LinkState>,
    pub(crate) next_id: ConnectionId,
    pub(crate) requests: Vec<ConnectRequest>,
    pub(crate) sent: Vec<Value>,
    pub(crate) closes: usize,
    pub(crate) aborts: usize,
}

impl FakeLink {
    pub(crate) fn sent_types(&self) -> Vec<String> {
        self.sent
            .iter()
            .map(|frame| frame["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub(crate) fn count(&self, kind: &str) -> usize {
        self.sent_types().iter().filter(|t| *t == kind).count()
    }
}

impl UpstreamLink for FakeLink {
    fn connect(&mut self, request: ConnectRequest) -> ConnectionId {
        self.requests.push(request);
        self.next_id += 1;
        self.state = Some(LinkState::Connecting);
        self.next_id
    }

    fn mark_ready(&mut self) {
        self.state = Some(LinkState::Ready);
    }

    fn send(&mut self, frame: &UpstreamFrame) -> bool {
        if self.state != Some(LinkState::Ready) {
            return false;
        }
        self.sent.push(serde_json::to_value(frame).unwrap());
        true
    }

    fn close(&mut self) {
        self.closes += 1;
        self.state = Some(LinkState::Absent);
    }

    fn abort(&mut self) {
        self.aborts += 1;
        self.state = Some(LinkState::Absent);
    }
}

#[derive(Default)]
pub(crate) struct Recorder {
    pub(crate) events: Vec<ClientEvent>,
    pub(crate) persisted: Vec<Turn>,
}

impl Recorder {
    pub(crate) fn kinds(&self) -> Vec<&'static str> {
        self.events.iter().map(ClientEvent::kind).collect()
    }

    pub(crate) fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

impl Downstream for Recorder {
    fn emit(&mut self, event: ClientEvent) {
        self.events.push(event);
    }

    fn persist(&mut self, turn: &Turn) {
        self.persisted.push(turn.clone());
    }
}
