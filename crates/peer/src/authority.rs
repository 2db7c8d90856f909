//! Participant end of the authority channel.

use std::io;

use rally_wire::frame::{FrameSink, FrameStream};
use rally_wire::{AuthorityEvent, AuthorityRequest};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Request queue out, event queue in. The event queue ending means the
/// authority is gone.
#[derive(Debug)]
pub struct AuthorityLink {
    pub requests: mpsc::UnboundedSender<AuthorityRequest>,
    pub events: mpsc::UnboundedReceiver<AuthorityEvent>,
}

impl AuthorityLink {
    pub fn new(
        requests: mpsc::UnboundedSender<AuthorityRequest>,
        events: mpsc::UnboundedReceiver<AuthorityEvent>,
    ) -> Self {
        Self { requests, events }
    }

    /// Connect to an authority served over TCP.
    pub async fn connect(addr: &str, max_frame_len: usize) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut frames = FrameStream::new(reader, max_frame_len);
        let mut sink = FrameSink::new(writer, max_frame_len);

        let (requests, mut request_rx) = mpsc::unbounded_channel::<AuthorityRequest>();
        let (event_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                if let Err(e) = sink.send(&request).await {
                    warn!(error = %e, "authority write failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match frames.recv::<AuthorityEvent>().await {
                    Ok(Some(event)) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("authority closed the channel");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "authority read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self { requests, events })
    }
}
