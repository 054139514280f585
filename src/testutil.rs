use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::rr::rdata::A;
use tokio::sync::mpsc;

use crate::addr::Socksaddr;
use crate::conn::PacketConn;
use crate::dns::Resolver;
use crate::error::DnsError;

/// In-memory packet connection fed through an mpsc channel.
pub struct MemoryPacketConn {
    incoming: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, Socksaddr)>>,
    pub written: Mutex<Vec<(Vec<u8>, Socksaddr)>>,
    pub writes: AtomicUsize,
    pub closes: AtomicUsize,
    pub overlapped: AtomicBool,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    wants_deadline: bool,
}

impl MemoryPacketConn {
    pub fn new(wants_deadline: bool) -> (Arc<Self>, mpsc::Sender<(Vec<u8>, Socksaddr)>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = MemoryPacketConn {
            incoming: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            wants_deadline,
        };
        (Arc::new(conn), tx)
    }

    pub fn written(&self) -> Vec<(Vec<u8>, Socksaddr)> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl PacketConn for MemoryPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<(usize, Socksaddr)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match self.incoming.lock().await.recv().await {
            Some((data, destination)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, destination))
            }
            None => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }

    async fn write_packet(&self, buf: &[u8], destination: &Socksaddr) -> io::Result<()> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.written
            .lock()
            .unwrap()
            .push((buf.to_vec(), destination.clone()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some("198.18.0.1:0".parse().unwrap())
    }

    fn needs_additional_read_deadline(&self) -> bool {
        self.wants_deadline
    }

    fn set_read_deadline(&self, _deadline: Option<tokio::time::Instant>) -> io::Result<()> {
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Resolver answering every A query with 93.184.216.34, or failing on demand.
pub struct StaticResolver {
    pub fail: bool,
    pub delay: Duration,
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn serve_msg(&self, request: &Message) -> Result<Message, DnsError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(DnsError::Resolve("upstream unreachable".into()));
        }

        let mut response = Message::new();
        response.set_message_type(MessageType::Response);
        for query in request.queries() {
            response.add_query(query.clone());
            if query.query_type() == RecordType::A {
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    300,
                    RData::A(A::new(93, 184, 216, 34)),
                ));
            }
        }
        Ok(response)
    }
}

pub fn a_query(id: u16, name: &str) -> Message {
    let mut query = Message::new();
    query
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
    query
}
