use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{read_record_async, write_record_async, Error, Frame, Request, Response};

/// Originating half of an RPC peer. Cheap to clone; calls from concurrent
/// tasks are correlated by frame id.
#[derive(Clone)]
pub struct RpcClient {
    tx: mpsc::UnboundedSender<Frame>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Sends a request and awaits the peer's response. Fails with
    /// [`Error::MasterGone`] once the connection is down.
    pub async fn call(&self, body: Request) -> Result<Response, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        self.tx
            .send(Frame::Request { id, body })
            .map_err(|_| Error::MasterGone)?;
        rx.await.map_err(|_| Error::MasterGone)
    }
}

/// A peer-originated request carrying its reply handle.
pub struct RpcRequest {
    pub body: Request,
    id: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

impl RpcRequest {
    pub fn respond(self, body: Response) {
        let _ = self.tx.send(Frame::Response { id: self.id, body });
    }
}

/// Starts reader and writer tasks over a connected stream pair. Returns
/// the client plus the stream of peer-originated requests; the stream ends
/// when the peer disconnects.
pub fn spawn_peer(
    reader: impl AsyncRead + Unpin + Send + 'static,
    writer: impl AsyncWrite + Unpin + Send + 'static,
) -> (RpcClient, mpsc::UnboundedReceiver<RpcRequest>) {
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>> = Default::default();
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = frame_rx.recv().await {
            if let Err(err) = write_record_async(&mut writer, &frame).await {
                debug!("rpc writer stopped: {err}");
                break;
            }
        }
    });
    let client = RpcClient {
        tx: frame_tx.clone(),
        pending: pending.clone(),
        next_id: Default::default(),
    };
    tokio::spawn(async move {
        let mut reader = reader;
        loop {
            match read_record_async::<Frame>(&mut reader).await {
                Ok(Frame::Request { id, body }) => {
                    let request = RpcRequest {
                        id,
                        body,
                        tx: frame_tx.clone(),
                    };
                    if req_tx.send(request).is_err() {
                        break;
                    }
                }
                Ok(Frame::Response { id, body }) => {
                    if let Some(tx) = pending.lock().unwrap().remove(&id) {
                        let _ = tx.send(body);
                    }
                }
                Err(err) => {
                    debug!("rpc reader stopped: {err}");
                    break;
                }
            }
        }
        // Fail every in-flight call by dropping its reply slot.
        pending.lock().unwrap().clear();
    });
    (client, req_rx)
}
