
use std::time::Duration;

use cellgate_kernel::{
    Channel, ConnectionInfo, ExecuteTimeouts, KernelClient, KernelError, ReplyStatus, Session,
};
use fake_kernel::{FakeKernel, SLOW_DELAY};

/// Connect and poke the kernel until iopub traffic shows up, so no output
/// is lost to a late subscription.
async fn ready_client(info: &ConnectionInfo) -> KernelClient {
    let mut client = KernelClient::connect(info.clone(), Session::default())
        .await
        .expect("connect");
    for _ in 0..20 {
        client
            .kernel_info(Duration::from_secs(2))
            .await
            .expect("kernel_info");
        if client.drain_iopub(Duration::from_millis(300)).await.unwrap() > 0 {
            return client;
        }
    }
    panic!("iopub subscription never became live");
}

#[tokio::test]
async fn execute_collects_stream_output() {
    let fake = FakeKernel::start().await;
    let mut client = ready_client(&fake.info).await;

    let outcome = client
        .execute("print('hi')", ExecuteTimeouts::default())
        .await
        .unwrap();
    // The stray "not yours" stream belongs to another request.
    assert_eq!(outcome.output, "hi\n");
    assert_eq!(outcome.status, ReplyStatus::Ok);
    assert_eq!(outcome.execution_count, Some(1));
}

#[tokio::test]
async fn execute_reports_traceback_as_output() {
    let fake = FakeKernel::start().await;
    let mut client = ready_client(&fake.info).await;

    let outcome = client
        .execute("1/0", ExecuteTimeouts::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ReplyStatus::Error);
    assert_eq!(
        outcome.output,
        "Traceback (most recent call last):\nZeroDivisionError: division by zero"
    );
}

#[tokio::test]
async fn execute_returns_plain_text_result() {
    let fake = FakeKernel::start().await;
    let mut client = ready_client(&fake.info).await;

    let first = client
        .execute("40 + 2", ExecuteTimeouts::default())
        .await
        .unwrap();
    assert_eq!(first.output, "40 + 2");

    let second = client
        .execute("print('again')", ExecuteTimeouts::default())
        .await
        .unwrap();
    assert_eq!(second.output, "again\n");
    assert_eq!(second.execution_count, Some(2));
}

#[tokio::test]
async fn missing_reply_times_out_and_client_recovers() {
    let fake = FakeKernel::start().await;
    let mut client = ready_client(&fake.info).await;

    let short = ExecuteTimeouts {
        shell: Duration::from_millis(300),
        iopub: Duration::from_millis(300),
    };
    let err = client.execute("hang", short).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(
        err,
        KernelError::Timeout {
            channel: Channel::Shell,
            ..
        }
    ));

    let outcome = client
        .execute("print('still here')", ExecuteTimeouts::default())
        .await
        .unwrap();
    assert_eq!(outcome.output, "still here\n");
}

#[tokio::test]
async fn late_reply_to_abandoned_cell_is_dropped() {
    let fake = FakeKernel::start().await;
    let mut client = ready_client(&fake.info).await;

    let short = ExecuteTimeouts {
        shell: SLOW_DELAY / 3,
        iopub: Duration::from_millis(200),
    };
    let err = client.execute("slow", short).await.unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");

    // The kernel finishes `slow` (reply, result and idle status) while this
    // request is already waiting behind it.
    let outcome = client
        .execute("print('fresh')", ExecuteTimeouts::default())
        .await
        .unwrap();
    assert_eq!(outcome.output, "fresh\n");
    assert_eq!(outcome.status, ReplyStatus::Ok);
    assert_eq!(outcome.execution_count, Some(2));
}

#[tokio::test]
async fn kernel_info_fields() {
    let fake = FakeKernel::start().await;
    let mut client = ready_client(&fake.info).await;

    let info = client.kernel_info(Duration::from_secs(2)).await.unwrap();
    assert_eq!(info.protocol_version, "5.3");
    assert_eq!(info.implementation, "fake");
    assert_eq!(info.language, "python");
    assert_eq!(info.language_version, "3.12");
    assert_eq!(info.banner, "fake kernel");
}

#[tokio::test]
async fn heartbeat_round_trip_and_silence() {
    let fake = FakeKernel::start().await;
    let mut client = ready_client(&fake.info).await;

    let rtt = client.heartbeat(Duration::from_secs(2)).await.unwrap();
    assert!(rtt < Duration::from_secs(2));

    fake.stop();
    let err = client
        .heartbeat(Duration::from_millis(300))
        .await
        .unwrap_err();
    // Depending on timing the port is either silent or already closed.
    assert!(
        matches!(
            err,
            KernelError::Timeout {
                channel: Channel::Heartbeat,
                ..
            } | KernelError::Socket {
                channel: Channel::Heartbeat,
                ..
            }
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn shutdown_request_is_acknowledged() {
    let fake = FakeKernel::start().await;
    let mut client = ready_client(&fake.info).await;

    client
        .shutdown(false, Duration::from_secs(2))
        .await
        .unwrap();
}
