//! Runs a `RaftNode` as a tokio task.
//!
//! The task owns the node and is the only place its state changes. Inbound
//! frames, RPC completions and status probes arrive over one channel;
//! outbound RPCs run on their own tasks and report back as completions.

use super::log::LogStore;
use super::node::{Completion, NodeStatus, Output, RaftNode, Ticket};
use super::state_machine::StateMachine;
use crate::protocol::{decode_request, decode_response, encode_request, encode_response};
use crate::protocol::{RaftRequest, RaftResponse};
use accord_common::error::{AccordError, Result};
use accord_common::types::{Member, NodeId, Term};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Delivers an encoded request frame to a member and returns its encoded
/// response frame.
pub trait Transport: Clone + Send + Sync + 'static {
    fn call(&self, target: &Member, frame: Bytes) -> impl Future<Output = Result<Bytes>> + Send;
}

enum Event {
    Frame {
        frame: Bytes,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Completion(Completion),
    Status(oneshot::Sender<NodeStatus>),
    Shutdown,
}

/// Cloneable handle to a running node
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    tx: mpsc::UnboundedSender<Event>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Serve one encoded request frame, resolving to the encoded response.
    /// A frame that does not decode fails on its own.
    pub async fn handle_frame(&self, frame: Bytes) -> Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Frame { frame, reply })
            .map_err(|_| AccordError::Shutdown(self.id))?;
        rx.await.map_err(|_| AccordError::Shutdown(self.id))?
    }

    /// Submit a request from inside the process
    pub async fn call(&self, request: RaftRequest) -> Result<RaftResponse> {
        let frame = self.handle_frame(encode_request(&request)).await?;
        Ok(decode_response(frame)?)
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Status(reply))
            .map_err(|_| AccordError::Shutdown(self.id))?;
        rx.await.map_err(|_| AccordError::Shutdown(self.id))
    }

    /// Stop the node; callers still waiting get `Shutdown`
    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Event::Shutdown)
            .map_err(|_| AccordError::Shutdown(self.id))
    }
}

/// Start driving `node` on the current tokio runtime
pub fn spawn<S, M, T>(node: RaftNode<S, M>, transport: T) -> (NodeHandle, JoinHandle<()>)
where
    S: LogStore,
    M: StateMachine,
    T: Transport,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = NodeHandle {
        id: node.id(),
        tx: tx.clone(),
    };
    let driver = Driver {
        node,
        transport,
        tx,
        rx,
        callers: HashMap::new(),
        next_ticket: 1,
    };
    (handle, tokio::spawn(driver.run()))
}

struct Driver<S: LogStore, M: StateMachine, T: Transport> {
    node: RaftNode<S, M>,
    transport: T,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    callers: HashMap<Ticket, oneshot::Sender<Result<Bytes>>>,
    next_ticket: Ticket,
}

impl<S: LogStore, M: StateMachine, T: Transport> Driver<S, M, T> {
    async fn run(mut self) {
        let id = self.node.id();
        let mut interval = tokio::time::interval(self.node.config().tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node = id, "node driver started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.node.tick() {
                        error!(node = id, error = %err, "tick failed");
                    }
                }
                event = self.rx.recv() => match event {
                    Some(Event::Frame { frame, reply }) => self.on_frame(frame, reply),
                    Some(Event::Completion(completion)) => {
                        if let Err(err) = self.node.handle_completion(completion) {
                            error!(node = id, error = %err, "completion failed");
                        }
                    }
                    Some(Event::Status(reply)) => {
                        let _ = reply.send(self.node.status());
                    }
                    Some(Event::Shutdown) | None => break,
                }
            }
            self.flush();
        }

        info!(node = id, pending = self.callers.len(), "node driver stopped");
    }

    fn on_frame(&mut self, frame: Bytes, reply: oneshot::Sender<Result<Bytes>>) {
        match decode_request(frame) {
            Ok(request) => {
                let ticket = self.next_ticket;
                self.next_ticket += 1;
                self.callers.insert(ticket, reply);
                self.node.step(ticket, request);
            }
            Err(err) => {
                warn!(node = self.node.id(), error = %err, "dropping malformed frame");
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    fn flush(&mut self) {
        for output in self.node.take_outputs() {
            match output {
                Output::Reply { ticket, response } => {
                    if let Some(reply) = self.callers.remove(&ticket) {
                        let _ = reply.send(Ok(encode_response(&response)));
                    }
                }
                Output::Send { to, term, request } => self.dispatch(to, term, request),
            }
        }
    }

    fn dispatch(&self, to: Member, term: Term, request: RaftRequest) {
        let transport = self.transport.clone();
        let tx = self.tx.clone();
        let timeout = self.node.config().rpc_timeout();
        tokio::spawn(async move {
            let frame = encode_request(&request);
            let result = match tokio::time::timeout(timeout, transport.call(&to, frame)).await {
                Ok(Ok(frame)) => decode_response(frame).map_err(|err| err.to_string()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(format!("rpc to {} timed out", to)),
            };
            if let Err(reason) = &result {
                debug!(peer = to.id, %reason, "rpc failed");
            }
            let completion = Completion {
                to: to.id,
                term,
                request,
                result,
            };
            // the driver may already be gone
            let _ = tx.send(Event::Completion(completion));
        });
    }
}
