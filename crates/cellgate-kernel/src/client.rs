//! Request/response exchanges over a kernel's channels.

use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::time::Instant;
use zeromq::{DealerSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::connection::{Channel, ConnectionInfo};
use crate::error::{KernelError, WireError};
use crate::output::OutputCollector;
use crate::wire::{JupyterMessage, Session, Signer};

/// Per-request deadlines for `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteTimeouts {
    /// Wait for the `execute_reply` on shell.
    pub shell: Duration,
    /// Wait for each individual iopub message after the reply.
    pub iopub: Duration,
}

impl Default for ExecuteTimeouts {
    fn default() -> Self {
        Self {
            shell: Duration::from_secs(10),
            iopub: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

impl ReplyStatus {
    /// Unknown values count as `Error`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "ok" => ReplyStatus::Ok,
            "aborted" => ReplyStatus::Aborted,
            _ => ReplyStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub output: String,
    pub status: ReplyStatus,
    pub execution_count: Option<u32>,
}

/// Fields of `kernel_info_reply` worth surfacing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelInfo {
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub language: String,
    pub language_version: String,
    pub banner: String,
}

impl KernelInfo {
    pub fn from_content(content: &Value) -> Self {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_string();
        let language_info = content.get("language_info");
        Self {
            protocol_version: text(content.get("protocol_version")),
            implementation: text(content.get("implementation")),
            implementation_version: text(content.get("implementation_version")),
            language: text(language_info.and_then(|l| l.get("name"))),
            language_version: text(language_info.and_then(|l| l.get("version"))),
            banner: text(content.get("banner")),
        }
    }
}

/// Connected shell, control and iopub sockets for one kernel.
pub struct KernelClient {
    info: ConnectionInfo,
    signer: Signer,
    session: Session,
    shell: DealerSocket,
    control: DealerSocket,
    iopub: SubSocket,
}

impl KernelClient {
    pub async fn connect(info: ConnectionInfo, session: Session) -> Result<Self, KernelError> {
        let mut shell = DealerSocket::new();
        shell
            .connect(&info.endpoint(Channel::Shell))
            .await
            .map_err(|e| KernelError::socket(Channel::Shell, e))?;

        let mut control = DealerSocket::new();
        control
            .connect(&info.endpoint(Channel::Control))
            .await
            .map_err(|e| KernelError::socket(Channel::Control, e))?;

        let mut iopub = SubSocket::new();
        iopub
            .connect(&info.endpoint(Channel::IoPub))
            .await
            .map_err(|e| KernelError::socket(Channel::IoPub, e))?;
        iopub
            .subscribe("")
            .await
            .map_err(|e| KernelError::socket(Channel::IoPub, e))?;

        tracing::debug!(shell = %info.endpoint(Channel::Shell), "connected to kernel channels");
        Ok(Self {
            signer: info.signer(),
            info,
            session,
            shell,
            control,
            iopub,
        })
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Run `code` and collect its text output.
    ///
    /// Waits for the matching `execute_reply`, then drains iopub until the
    /// kernel reports idle for this request.
    pub async fn execute(
        &mut self,
        code: &str,
        timeouts: ExecuteTimeouts,
    ) -> Result<ExecutionOutcome, KernelError> {
        let request = JupyterMessage::new(
            "execute_request",
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
            &self.session,
        );
        let request_id = request.msg_id().to_string();
        send_message(&mut self.shell, Channel::Shell, &self.signer, &request).await?;
        tracing::debug!(msg_id = %request_id, "execute_request sent");

        let reply = recv_reply(
            &mut self.shell,
            Channel::Shell,
            &self.signer,
            &request_id,
            timeouts.shell,
        )
        .await?;
        let status = reply
            .content
            .get("status")
            .and_then(Value::as_str)
            .map(ReplyStatus::parse)
            .unwrap_or(ReplyStatus::Error);
        let execution_count = reply
            .content
            .get("execution_count")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());

        let mut collector = OutputCollector::new(request_id);
        while !collector.is_done() {
            let deadline = Instant::now() + timeouts.iopub;
            let msg = recv_message(
                &mut self.iopub,
                Channel::IoPub,
                &self.signer,
                deadline,
                timeouts.iopub,
            )
            .await?;
            collector.feed(&msg);
        }

        Ok(ExecutionOutcome {
            output: collector.finish(),
            status,
            execution_count,
        })
    }

    pub async fn kernel_info(&mut self, timeout: Duration) -> Result<KernelInfo, KernelError> {
        let request = JupyterMessage::new("kernel_info_request", json!({}), &self.session);
        send_message(&mut self.shell, Channel::Shell, &self.signer, &request).await?;
        let reply = recv_reply(
            &mut self.shell,
            Channel::Shell,
            &self.signer,
            request.msg_id(),
            timeout,
        )
        .await?;
        if reply.msg_type() != "kernel_info_reply" {
            return Err(KernelError::Protocol(format!(
                "expected kernel_info_reply, got {}",
                reply.msg_type()
            )));
        }
        Ok(KernelInfo::from_content(&reply.content))
    }

    /// Read and discard iopub messages until none arrives for `quiet`.
    ///
    /// Returns how many were discarded. A non-zero count proves the
    /// subscription is live.
    pub async fn drain_iopub(&mut self, quiet: Duration) -> Result<usize, KernelError> {
        let mut drained = 0;
        loop {
            let deadline = Instant::now() + quiet;
            let next =
                recv_message(&mut self.iopub, Channel::IoPub, &self.signer, deadline, quiet).await;
            match next {
                Ok(msg) => {
                    tracing::trace!(msg_type = msg.msg_type(), "drained iopub message");
                    drained += 1;
                }
                Err(KernelError::Timeout { .. }) => return Ok(drained),
                Err(err) => return Err(err),
            }
        }
    }

    /// Ping the heartbeat channel and return the round-trip time.
    ///
    /// A fresh REQ socket is used for every ping so a lost reply never wedges
    /// the socket's send/receive state.
    pub async fn heartbeat(&mut self, timeout: Duration) -> Result<Duration, KernelError> {
        let endpoint = self.info.endpoint(Channel::Heartbeat);
        let started = Instant::now();
        let ping = Bytes::from_static(b"ping");
        let exchange = async {
            let mut socket = ReqSocket::new();
            socket
                .connect(&endpoint)
                .await
                .map_err(|e| KernelError::socket(Channel::Heartbeat, e))?;
            socket
                .send(ZmqMessage::from(ping.clone()))
                .await
                .map_err(|e| KernelError::socket(Channel::Heartbeat, e))?;
            socket
                .recv()
                .await
                .map_err(|e| KernelError::socket(Channel::Heartbeat, e))
        };
        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| KernelError::Timeout {
                channel: Channel::Heartbeat,
                timeout,
            })??;
        if reply.into_vec().first() != Some(&ping) {
            return Err(KernelError::Protocol("heartbeat echo mismatch".into()));
        }
        Ok(started.elapsed())
    }

    /// Ask the kernel to exit via the control channel.
    pub async fn shutdown(&mut self, restart: bool, timeout: Duration) -> Result<(), KernelError> {
        let request = JupyterMessage::new(
            "shutdown_request",
            json!({ "restart": restart }),
            &self.session,
        );
        send_message(&mut self.control, Channel::Control, &self.signer, &request).await?;
        recv_reply(
            &mut self.control,
            Channel::Control,
            &self.signer,
            request.msg_id(),
            timeout,
        )
        .await?;
        Ok(())
    }
}

pub(crate) fn to_zmq(frames: Vec<Bytes>) -> Result<ZmqMessage, WireError> {
    let mut frames = frames.into_iter();
    let first = frames.next().ok_or(WireError::Empty)?;
    let mut msg = ZmqMessage::from(first);
    for frame in frames {
        msg.push_back(frame);
    }
    Ok(msg)
}

async fn send_message<S: SocketSend + Send>(
    socket: &mut S,
    channel: Channel,
    signer: &Signer,
    msg: &JupyterMessage,
) -> Result<(), KernelError> {
    let frames = msg.to_frames(signer)?;
    socket
        .send(to_zmq(frames)?)
        .await
        .map_err(|e| KernelError::socket(channel, e))
}

async fn recv_message<S: SocketRecv + Send>(
    socket: &mut S,
    channel: Channel,
    signer: &Signer,
    deadline: Instant,
    timeout: Duration,
) -> Result<JupyterMessage, KernelError> {
    let raw = tokio::time::timeout_at(deadline, socket.recv())
        .await
        .map_err(|_| KernelError::Timeout { channel, timeout })?
        .map_err(|e| KernelError::socket(channel, e))?;
    Ok(JupyterMessage::from_frames(raw.into_vec(), signer)?)
}

/// Read from `socket` until the reply to `parent_id` arrives, dropping
/// replies to earlier requests that were abandoned after a timeout.
async fn recv_reply<S: SocketRecv + Send>(
    socket: &mut S,
    channel: Channel,
    signer: &Signer,
    parent_id: &str,
    timeout: Duration,
) -> Result<JupyterMessage, KernelError> {
    let deadline = Instant::now() + timeout;
    loop {
        let msg = recv_message(socket, channel, signer, deadline, timeout).await?;
        if msg.parent_msg_id() == Some(parent_id) {
            return Ok(msg);
        }
        tracing::debug!(
            %channel,
            msg_type = msg.msg_type(),
            "dropping reply to a previous request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_info_from_reply_content() {
        let content = json!({
            "status": "ok",
            "protocol_version": "5.3",
            "implementation": "ipython",
            "implementation_version": "8.20.0",
            "language_info": { "name": "python", "version": "3.12.1", "mimetype": "text/x-python" },
            "banner": "Python 3.12.1",
        });
        let info = KernelInfo::from_content(&content);
        assert_eq!(info.protocol_version, "5.3");
        assert_eq!(info.implementation, "ipython");
        assert_eq!(info.language, "python");
        assert_eq!(info.language_version, "3.12.1");
        assert_eq!(info.banner, "Python 3.12.1");
    }

    #[test]
    fn kernel_info_tolerates_missing_fields() {
        let info = KernelInfo::from_content(&json!({}));
        assert_eq!(info, KernelInfo::default());
    }

    #[test]
    fn reply_status_parsing() {
        assert_eq!(ReplyStatus::parse("ok"), ReplyStatus::Ok);
        assert_eq!(ReplyStatus::parse("aborted"), ReplyStatus::Aborted);
        assert_eq!(ReplyStatus::parse("error"), ReplyStatus::Error);
        assert_eq!(ReplyStatus::parse("unexpected"), ReplyStatus::Error);
    }

    #[test]
    fn zmq_message_keeps_frame_order() {
        let frames = vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ];
        let msg = to_zmq(frames.clone()).unwrap();
        assert_eq!(msg.into_vec(), frames);
        assert!(matches!(to_zmq(vec![]), Err(WireError::Empty)));
    }
}
