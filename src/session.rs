//! Per-client send task, pending queue, and skew/offset bookkeeping.
//! Grounded on `relay::socket::SendSocket`/`SendState`: an unbounded queue
//! feeds a dedicated task that owns the socket; the producer (the pipeline)
//! never blocks on a slow or dead client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::time::Time;

/// One already-framed (length-prefixed) payload ready to be written as-is.
pub type Frame = Bytes;

async fn run_worker(mut socket: TcpStream, mut out_rx: mpsc::UnboundedReceiver<Frame>, mut quit_rx: oneshot::Receiver<()>, closed: Arc<AtomicBool>) {
	loop {
		tokio::select! {
			_ = &mut quit_rx => {
				debug!("client worker told to quit, draining remaining queue without sending");
				break;
			}
			msg = out_rx.recv() => {
				match msg {
					None => {
						debug!("client out-queue closed, exiting worker");
						break;
					}
					Some(frame) => {
						if let Err(e) = socket.write_all(&frame).await {
							warn!("client write failed, closing session: {}", e);
							break;
						}
						trace!("wrote {} bytes to client", frame.len());
					}
				}
			}
		}
	}
	closed.store(true, Ordering::Release);
}

/// Per-client bookkeeping plus the handle to its send task. Owned
/// exclusively by the pipeline; the worker owns the socket and the out-queue
/// consumer end.
pub struct ClientSession {
	out_tx: mpsc::UnboundedSender<Frame>,
	quit_tx: Option<oneshot::Sender<()>>,
	worker: Option<JoinHandle<()>>,
	closed: Arc<AtomicBool>,

	pub connect_time: Time,
	pub stimulation_offset: Time,
	pub samples_to_skip: u32,
}

impl ClientSession {
	pub fn spawn(socket: TcpStream, connect_time: Time) -> Self {
		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let (quit_tx, quit_rx) = oneshot::channel();
		let closed = Arc::new(AtomicBool::new(false));
		let worker = tokio::spawn(run_worker(socket, out_rx, quit_rx, closed.clone()));
		Self {
			out_tx,
			quit_tx: Some(quit_tx),
			worker: Some(worker),
			closed,
			connect_time,
			stimulation_offset: Time::ZERO,
			samples_to_skip: 0,
		}
	}

	/// Enqueue a pre-framed payload. Never blocks; if the worker has already
	/// exited the frame is simply dropped.
	pub fn enqueue(&self, frame: Frame) {
		let _ = self.out_tx.send(frame);
	}

	/// True once the worker has observed a write error or a closed queue.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Signal the worker to stop and await it. Idempotent.
	pub async fn shutdown(&mut self) {
		if let Some(quit_tx) = self.quit_tx.take() {
			let _ = quit_tx.send(());
		}
		if let Some(worker) = self.worker.take() {
			let _ = worker.await;
		}
	}
}
