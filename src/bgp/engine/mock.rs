//! Scriptable engine for testing peer workers.
//!
//! `MockEngine` is both the factory and the engine: every engine it creates
//! shares the same script and recorders, so a test keeps a clone and
//! inspects what the worker did after handing the factory over.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, Span};

use super::{
    EngineError, EngineFactory, EngineResult, EngineState, EstablishAction, EstablishStep,
    Negotiated, Neighbor, ProtocolEngine,
};
use crate::bgp::family::AddressFamily;
use crate::bgp::message::{Header, Message, MessageType, OpenMessage, UpdateMessage};
use crate::bgp::route::NlriAction;

#[derive(Debug, Default)]
struct MockInner {
    steps: VecDeque<EngineResult<EstablishStep>>,
    negotiated: Option<Negotiated>,
    incoming: VecDeque<EngineResult<Message>>,
    written: Vec<Vec<u8>>,
    neighbors: Vec<Neighbor>,
    connected: bool,
    close_count: usize,
    fail_writes: bool,
    fail_encoding: bool,
}

/// A mock protocol engine.
///
/// - establishment replays the queued steps, then reports success
/// - reads pop queued messages, or return `Nop` when the queue is empty
/// - writes are captured for verification
#[derive(Debug, Clone)]
pub struct MockEngine {
    inner: Arc<Mutex<MockInner>>,
    log: Span,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner::default())),
            log: Span::none(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an establishment step.
    pub fn queue_step(&self, state: EngineState, action: EstablishAction) {
        self.lock().steps.push_back(Ok(EstablishStep::new(state, action)));
    }

    /// Queue an establishment failure.
    pub fn queue_establish_error(&self, error: EngineError) {
        self.lock().steps.push_back(Err(error));
    }

    /// Set the negotiated context reported once established.
    pub fn set_negotiated(&self, negotiated: Negotiated) {
        self.lock().negotiated = Some(negotiated);
    }

    /// Convenience: the peer accepted an OPEN advertising `families`.
    pub fn negotiate(&self, families: &[AddressFamily], hold_time: u16) {
        let open = OpenMessage::new_with_families(65000, hold_time, Ipv4Addr::new(192, 0, 2, 254), families);
        self.set_negotiated(Negotiated {
            hold_time,
            received_open: open,
        });
    }

    /// Queue a message to be returned by the next read.
    pub fn queue_receive(&self, message: Message) {
        self.lock().incoming.push_back(Ok(message));
    }

    /// Queue an error to be returned by the next read.
    pub fn queue_receive_error(&self, error: EngineError) {
        self.lock().incoming.push_back(Err(error));
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Neighbors the factory was asked to create engines for.
    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.lock().neighbors.clone()
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_encoding(&self, fail: bool) {
        self.lock().fail_encoding = fail;
    }

    /// Simulate the connection object going away.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }
}

impl EngineFactory for MockEngine {
    type Engine = MockEngine;

    fn create(&mut self, neighbor: Neighbor, log: Span) -> MockEngine {
        log.in_scope(|| debug!(peer = %neighbor.peer_address, "Creating mock engine"));
        {
            let mut inner = self.lock();
            inner.neighbors.push(neighbor);
            inner.connected = true;
        }
        MockEngine {
            inner: self.inner.clone(),
            log,
        }
    }
}

impl ProtocolEngine for MockEngine {
    async fn establish_step(&mut self) -> EngineResult<Option<EstablishStep>> {
        match self.lock().steps.pop_front() {
            Some(Ok(step)) => Ok(Some(step)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn wait_readable(&mut self, timeout: Duration) {
        let idle = self.lock().incoming.is_empty();
        if idle {
            tokio::time::sleep(timeout).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn read_message(&mut self) -> EngineResult<Message> {
        self.lock().incoming.pop_front().unwrap_or(Ok(Message::Nop))
    }

    async fn write(&mut self, data: &[u8]) -> EngineResult<()> {
        let mut inner = self.lock();
        if !inner.connected || inner.fail_writes {
            return Err(EngineError::LostConnection("mock write failed".into()));
        }
        inner.written.push(data.to_vec());
        Ok(())
    }

    fn negotiated(&self) -> Option<Negotiated> {
        self.lock().negotiated.clone()
    }

    /// Encodes each NLRI as `afi(2) safi(1) action(1) len(1) prefix`, behind
    /// a regular UPDATE header.
    fn encode_update(&self, update: &UpdateMessage) -> EngineResult<Bytes> {
        let inner = self.lock();
        if inner.fail_encoding {
            return Err(EngineError::Encode("mock encoding failure".into()));
        }
        if inner.negotiated.is_none() {
            return Err(EngineError::Encode("session not negotiated".into()));
        }

        let mut body = BytesMut::new();
        for nlri in &update.nlris {
            let prefix_len = u8::try_from(nlri.prefix.len())
                .map_err(|_| EngineError::Encode("prefix too long".into()))?;
            body.put_u16(nlri.family.afi);
            body.put_u8(nlri.family.safi);
            body.put_u8(match nlri.action {
                NlriAction::Unset => 0,
                NlriAction::Announced => 1,
                NlriAction::Withdrawn => 2,
            });
            body.put_u8(prefix_len);
            body.put_slice(&nlri.prefix);
        }

        let header = Header::for_body(MessageType::Update, body.len())
            .map_err(|e| EngineError::Encode(e.to_string()))?;
        let mut buf = BytesMut::with_capacity(header.length as usize);
        header.encode(&mut buf);
        buf.put(body);
        Ok(buf.freeze())
    }

    async fn close(&mut self) {
        self.log.in_scope(|| debug!("Closing mock engine"));
        let mut inner = self.lock();
        inner.connected = false;
        inner.close_count += 1;
    }
}
