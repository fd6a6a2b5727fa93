use std::{fmt, io, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};

use crate::conduit::{
    channel::{ClientChannel, CloseReason, MessageSink, MessageSource},
    credential::Credential,
    net::{BoxedStream, Dialer},
    protocol::{self, ConnectRequest, HeaderError},
    telemetry,
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub dial_timeout: Duration,
    /// Zero disables the handshake deadline.
    pub handshake_timeout: Duration,
    /// Upper bound on bytes read from the target before they are handed to the client.
    pub buffer_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    AwaitingHeader,
    Authenticating,
    Relaying,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("client->target"),
            Direction::TargetToClient => f.write_str("target->client"),
        }
    }
}

/// Which side ended a relay that finished without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    TargetClosed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake rejected: {0}")]
    Header(#[from] HeaderError),
    #[error("client closed after {buffered} header bytes")]
    ClientClosed { buffered: usize },
    #[error("client read failed during handshake: {0}")]
    ClientIo(#[source] io::Error),
    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("dial {destination} failed: {source}")]
    DialFailed {
        destination: String,
        #[source]
        source: io::Error,
    },
    #[error("dial {destination} timed out after {timeout:?}")]
    DialTimeout {
        destination: String,
        timeout: Duration,
    },
    #[error("relay {direction} failed: {source}")]
    Relay {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct SessionReport {
    pub id: String,
    pub client: String,
    pub destination: Option<String>,
    pub state: SessionState,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub outcome: Result<RelayEnd, SessionError>,
}

/// Builds sessions that share one read-only credential and dialer.
#[derive(Clone)]
pub struct SessionFactory {
    credential: Credential,
    dialer: Arc<dyn Dialer>,
    opts: SessionOptions,
}

impl SessionFactory {
    pub fn new(credential: Credential, dialer: Arc<dyn Dialer>, opts: SessionOptions) -> Self {
        Self {
            credential,
            dialer,
            opts,
        }
    }

    pub fn session<C: ClientChannel>(&self, channel: C, client: impl Into<String>) -> Session<C> {
        let (sink, source) = channel.split();
        Session {
            id: telemetry::new_session_id(),
            client: client.into(),
            credential: self.credential,
            dialer: self.dialer.clone(),
            opts: self.opts.clone(),
            sink,
            source,
            state: SessionState::AwaitingHeader,
            inbound: BytesMut::new(),
            target: None,
        }
    }
}

/// One client tunnel from acceptance to teardown.
pub struct Session<C: ClientChannel> {
    id: String,
    client: String,
    credential: Credential,
    dialer: Arc<dyn Dialer>,
    opts: SessionOptions,
    sink: C::Sink,
    source: C::Source,
    state: SessionState,
    inbound: BytesMut,
    target: Option<BoxedStream>,
}

impl<C: ClientChannel> Session<C> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the session to completion. Failures are reported, logged and counted
    /// here; nothing is propagated to the caller.
    pub async fn run(mut self) -> SessionReport {
        let _active = telemetry::ActiveSessionGuard::new();

        let mut report = SessionReport {
            id: self.id.clone(),
            client: self.client.clone(),
            destination: None,
            state: self.state,
            bytes_up: 0,
            bytes_down: 0,
            outcome: Ok(RelayEnd::ClientClosed),
        };

        let outcome = self.drive(&mut report).await;
        let reason = match outcome {
            Ok(_) => CloseReason::Finished,
            Err(_) => CloseReason::Aborted,
        };
        self.close(reason).await;

        report.state = self.state;
        report.outcome = outcome;
        log_report(&report);
        report
    }

    async fn drive(&mut self, report: &mut SessionReport) -> Result<RelayEnd, SessionError> {
        let req = self.await_header().await?;
        report.destination = Some(req.destination());

        self.dial(&req).await?;

        self.relay(req.trailing_payload, report).await
    }

    fn advance(&mut self, next: SessionState) {
        if next > self.state {
            self.state = next;
        }
    }

    async fn await_header(&mut self) -> Result<ConnectRequest, SessionError> {
        let deadline = self.opts.handshake_timeout;
        if deadline.is_zero() {
            return self.read_header().await;
        }
        time::timeout(deadline, self.read_header())
            .await
            .map_err(|_| SessionError::HandshakeTimeout(deadline))?
    }

    async fn read_header(&mut self) -> Result<ConnectRequest, SessionError> {
        loop {
            let chunk = match self.source.recv().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return Err(SessionError::ClientIo(err)),
                None => {
                    return Err(SessionError::ClientClosed {
                        buffered: self.inbound.len(),
                    });
                }
            };
            self.inbound.extend_from_slice(&chunk);

            if let Some((req, consumed)) = protocol::parse_header(&self.inbound, &self.credential)? {
                tracing::debug!(
                    sid = %self.id,
                    header_bytes = consumed,
                    trailing = req.trailing_payload.len(),
                    destination = %req.destination(),
                    "session: header accepted"
                );
                self.inbound = BytesMut::new();
                return Ok(req);
            }
        }
    }

    async fn dial(&mut self, req: &ConnectRequest) -> Result<(), SessionError> {
        self.advance(SessionState::Authenticating);

        let destination = req.destination();
        let timeout = self.opts.dial_timeout;
        let dial = self.dialer.dial(&req.address, req.port);

        let res = if timeout.is_zero() {
            dial.await
        } else {
            match time::timeout(timeout, dial).await {
                Ok(res) => res,
                Err(_) => {
                    return Err(SessionError::DialTimeout {
                        destination,
                        timeout,
                    });
                }
            }
        };

        let stream = res.map_err(|source| SessionError::DialFailed {
            destination,
            source,
        })?;
        self.target = Some(stream);
        Ok(())
    }

    async fn relay(
        &mut self,
        trailing: Bytes,
        report: &mut SessionReport,
    ) -> Result<RelayEnd, SessionError> {
        let Some(target) = self.target.take() else {
            return Err(SessionError::Relay {
                direction: Direction::ClientToTarget,
                source: io::ErrorKind::NotConnected.into(),
            });
        };
        self.advance(SessionState::Relaying);

        let (mut rd, mut wr) = tokio::io::split(target);

        let end = match forward_trailing(&mut wr, &trailing, &mut report.bytes_up).await {
            Err(source) => Err(SessionError::Relay {
                direction: Direction::ClientToTarget,
                source,
            }),
            Ok(()) => {
                let up = client_to_target(&mut self.source, &mut wr, &mut report.bytes_up);
                let down = target_to_client(
                    &mut rd,
                    &mut self.sink,
                    self.opts.buffer_size,
                    &mut report.bytes_down,
                );
                // Whichever direction finishes first cancels the other.
                tokio::select! {
                    r = up => r.map(|()| RelayEnd::ClientClosed).map_err(|source| SessionError::Relay {
                        direction: Direction::ClientToTarget,
                        source,
                    }),
                    r = down => r.map(|()| RelayEnd::TargetClosed).map_err(|source| SessionError::Relay {
                        direction: Direction::TargetToClient,
                        source,
                    }),
                }
            }
        };

        self.target = Some(rd.unsplit(wr));
        end
    }

    /// Releases both ends. Safe to call repeatedly; only the first call acts.
    async fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.advance(SessionState::Closed);

        if let Some(mut target) = self.target.take() {
            let _ = target.shutdown().await;
        }
        self.sink.close(reason).await;
        self.inbound = BytesMut::new();
    }
}

async fn forward_trailing<W>(target: &mut W, trailing: &[u8], counter: &mut u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if trailing.is_empty() {
        return Ok(());
    }
    target.write_all(trailing).await?;
    *counter += trailing.len() as u64;
    target.flush().await
}

async fn client_to_target<S, W>(source: &mut S, target: &mut W, counter: &mut u64) -> io::Result<()>
where
    S: MessageSource + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    while let Some(msg) = source.recv().await {
        let chunk = msg?;
        if chunk.is_empty() {
            continue;
        }
        target.write_all(&chunk).await?;
        // Counted once accepted by the writer, even if the flush below fails.
        *counter += chunk.len() as u64;
        target.flush().await?;
    }
    Ok(())
}

async fn target_to_client<R, S>(
    target: &mut R,
    sink: &mut S,
    buffer_size: usize,
    counter: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    S: MessageSink + ?Sized,
{
    let buffer_size = buffer_size.max(1);
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        buf.reserve(buffer_size);
        let n = (&mut *target).take(buffer_size as u64).read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.send(buf.split().freeze()).await?;
        *counter += n as u64;
    }
}

fn log_report(r: &SessionReport) {
    let destination = r.destination.as_deref().unwrap_or("");

    if r.bytes_up > 0 {
        metrics::counter!("conduit_bytes_upstream_total").increment(r.bytes_up);
    }
    if r.bytes_down > 0 {
        metrics::counter!("conduit_bytes_downstream_total").increment(r.bytes_down);
    }

    match &r.outcome {
        Ok(end) => {
            tracing::info!(
                sid = %r.id,
                client = %r.client,
                destination = %destination,
                bytes_up = r.bytes_up,
                bytes_down = r.bytes_down,
                end = ?end,
                "session: closed"
            );
        }
        Err(SessionError::Header(err)) => {
            metrics::counter!("conduit_handshake_failures_total", "reason" => err.kind())
                .increment(1);
            tracing::warn!(sid = %r.id, client = %r.client, err = %err, "session: handshake rejected");
        }
        Err(err @ (SessionError::DialFailed { .. } | SessionError::DialTimeout { .. })) => {
            metrics::counter!("conduit_dial_failures_total").increment(1);
            tracing::warn!(
                sid = %r.id,
                client = %r.client,
                destination = %destination,
                err = %err,
                "session: dial failed"
            );
        }
        Err(err @ SessionError::Relay { .. }) => {
            tracing::debug!(
                sid = %r.id,
                client = %r.client,
                destination = %destination,
                bytes_up = r.bytes_up,
                bytes_down = r.bytes_down,
                err = %err,
                "session: relay ended with error"
            );
        }
        Err(err) => {
            metrics::counter!("conduit_handshake_failures_total", "reason" => "incomplete")
                .increment(1);
            tracing::debug!(sid = %r.id, client = %r.client, err = %err, "session: handshake abandoned");
        }
    }
}
