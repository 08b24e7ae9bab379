//! Accept loop producing `PendingConnection` records over an unbounded
//! channel. Grounded on `relay::socket::RecvState::run`'s accept arm, minus
//! the handshake: this protocol has no client-to-server hello, the pipeline
//! itself decides what each new connection receives.

use std::time::Instant;

use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A freshly accepted socket, not yet known to the pipeline's hot loop.
pub struct PendingConnection {
	pub socket: TcpStream,
	pub addr: std::net::SocketAddr,
	/// Wall-clock instant the connection was accepted, for the pipeline to
	/// translate into sample-rate `Time` relative to its own start instant.
	pub accepted_at: Instant,
}

/// Owns the listening socket and the accept task. The hot loop only ever
/// sees `PendingConnection`s through the channel returned by `spawn`; no
/// shared mutex guards the listener, matching §9's replacement of the
/// source's double-lock pattern with a plain SPSC channel.
pub struct ListenerTask {
	handle: Option<JoinHandle<()>>,
	local_addr: std::net::SocketAddr,
}

impl ListenerTask {
	pub fn spawn(listener: TcpListener) -> (Self, mpsc::UnboundedReceiver<PendingConnection>) {
		let local_addr = listener.local_addr().expect("bound listener always has a local address");
		let (tx, rx) = mpsc::unbounded_channel();
		let handle = tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((socket, addr)) => {
						info!("accepted connection from {}", addr);
						let pending = PendingConnection {
							socket,
							addr,
							accepted_at: Instant::now(),
						};
						if tx.send(pending).is_err() {
							debug!("pipeline gone, shutting down accept loop");
							return;
						}
					}
					Err(e) => {
						error!("accept failed, ending accept loop: {}", e);
						return;
					}
				}
			}
		});
		(Self { handle: Some(handle), local_addr }, rx)
	}

	pub fn local_addr(&self) -> std::net::SocketAddr {
		self.local_addr
	}

	/// Stop the accept loop. The listening socket is owned by the spawned
	/// task, so cancellation goes through aborting that task rather than
	/// closing the socket from the outside.
	pub async fn stop(&mut self) {
		if let Some(handle) = self.handle.take() {
			handle.abort();
			let _ = handle.await;
		}
	}
}
